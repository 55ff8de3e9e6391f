//! [`MediaEngine`] backed by the `webrtc` crate.
//!
//! Local tracks are registered as static-sample tracks; feeding them with
//! captured frames is the capture pipeline's business, not the engine's.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine as CodecRegistry};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionHandle, Connectivity, EngineEvent, EngineEventSink, IceServer, LocalMedia, LocalTrack,
    MediaEngine, MediaError, RemoteTrack, TrackKind,
};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

struct Connection {
    peer: Arc<RTCPeerConnection>,
    stream_id: Mutex<String>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

pub struct WebRtcMediaEngine {
    api: API,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl WebRtcMediaEngine {
    pub fn new() -> Result<Self, MediaError> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs().map_err(negotiation)?;
        let registry = register_default_interceptors(Registry::new(), &mut codecs).map_err(negotiation)?;
        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn connection(&self, handle: &ConnectionHandle) -> Result<Arc<Connection>, MediaError> {
        self.connections
            .lock()
            .get(&handle.id())
            .cloned()
            .ok_or(MediaError::UnknownConnection(handle.id()))
    }

    async fn add_track(&self, connection: &Connection, track: &LocalTrack) -> Result<(), MediaError> {
        let local = static_track(track, &connection.stream_id.lock().clone());
        let sender = connection
            .peer
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;
        connection.senders.lock().insert(track.kind, sender);
        Ok(())
    }
}

fn negotiation(err: impl std::fmt::Display) -> MediaError {
    MediaError::Negotiation(err.to_string())
}

fn static_track(track: &LocalTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    let mime_type = match track.kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        track.id.clone(),
        stream_id.to_owned(),
    ))
}

fn to_rtc_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(negotiation)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(MediaError::Negotiation(format!("unsupported description type {other}"))),
    }
}

fn connectivity(state: RTCPeerConnectionState) -> Connectivity {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => Connectivity::New,
        RTCPeerConnectionState::Connecting => Connectivity::Connecting,
        RTCPeerConnectionState::Connected => Connectivity::Connected,
        RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
        RTCPeerConnectionState::Failed => Connectivity::Failed,
        RTCPeerConnectionState::Closed => Connectivity::Closed,
    }
}

fn wire_callbacks(peer: &RTCPeerConnection, events: EngineEventSink) {
    let candidate_events = events.clone();
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.emit(EngineEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid.unwrap_or_default(),
                    sdp_mline_index: init.sdp_mline_index.unwrap_or_default(),
                })),
                Err(err) => {
                    tracing::debug!(target = "call", error = %err, "failed to encode local candidate");
                }
            }
        })
    }));

    let state_events = events.clone();
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            tracing::debug!(target = "call", state = %state, "peer connection state changed");
            events.emit(EngineEvent::Connectivity(connectivity(state)));
        })
    }));

    peer.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                events.emit(EngineEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));
            })
        },
    ));
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: EngineEventSink,
    ) -> Result<ConnectionHandle, MediaError> {
        let config = RTCConfiguration {
            ice_servers: to_rtc_servers(ice_servers),
            ..Default::default()
        };
        let peer = Arc::new(self.api.new_peer_connection(config).await.map_err(negotiation)?);
        wire_callbacks(&peer, events);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(
            id,
            Arc::new(Connection {
                peer,
                stream_id: Mutex::new(String::new()),
                senders: Mutex::new(HashMap::new()),
            }),
        );
        tracing::debug!(target = "call", connection = id, "peer connection created");
        Ok(ConnectionHandle::new(id))
    }

    async fn add_local_media(&self, handle: &ConnectionHandle, media: &LocalMedia) -> Result<(), MediaError> {
        let connection = self.connection(handle)?;
        *connection.stream_id.lock() = media.stream_id.clone();
        for track in media.tracks() {
            self.add_track(&connection, track).await?;
        }
        Ok(())
    }

    async fn create_offer(&self, handle: &ConnectionHandle) -> Result<SessionDescription, MediaError> {
        let connection = self.connection(handle)?;
        let offer = connection.peer.create_offer(None).await.map_err(negotiation)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self, handle: &ConnectionHandle) -> Result<SessionDescription, MediaError> {
        let connection = self.connection(handle)?;
        let answer = connection.peer.create_answer(None).await.map_err(negotiation)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        handle: &ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let connection = self.connection(handle)?;
        connection
            .peer
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(
        &self,
        handle: &ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let connection = self.connection(handle)?;
        connection
            .peer
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(negotiation)
    }

    async fn add_remote_candidate(
        &self,
        handle: &ConnectionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        let connection = self.connection(handle)?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        connection.peer.add_ice_candidate(init).await.map_err(negotiation)
    }

    async fn replace_local_track(&self, handle: &ConnectionHandle, track: &LocalTrack) -> Result<(), MediaError> {
        let connection = self.connection(handle)?;
        let sender = connection.senders.lock().get(&track.kind).cloned();
        match sender {
            Some(sender) => {
                let local = static_track(track, &connection.stream_id.lock().clone());
                sender
                    .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(negotiation)
            }
            None => self.add_track(&connection, track).await,
        }
    }

    async fn close(&self, handle: ConnectionHandle) {
        let connection = self.connections.lock().remove(&handle.id());
        if let Some(connection) = connection {
            if let Err(err) = connection.peer.close().await {
                tracing::debug!(target = "call", connection = handle.id(), error = %err, "peer connection close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaConstraints;
    use crate::media::MediaAcquisition;
    use crate::media::source::StaticMediaSource;

    fn quiet_sink() -> EngineEventSink {
        EngineEventSink::new(|_| {})
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_exchange_between_two_connections() {
        let engine = WebRtcMediaEngine::new().expect("engine");
        let source = StaticMediaSource::default();

        let caller = engine.create_connection(&[], quiet_sink()).await.expect("caller");
        let media = source
            .acquire_local_media(&MediaConstraints::default())
            .await
            .expect("media");
        engine.add_local_media(&caller, &media).await.expect("tracks");
        let offer = engine.create_offer(&caller).await.expect("offer");
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        engine.set_local_description(&caller, &offer).await.expect("local offer");

        let callee = engine.create_connection(&[], quiet_sink()).await.expect("callee");
        engine.set_remote_description(&callee, &offer).await.expect("remote offer");
        let answer = engine.create_answer(&callee).await.expect("answer");
        assert_eq!(answer.kind, SdpType::Answer);
        engine.set_local_description(&callee, &answer).await.expect("local answer");
        engine.set_remote_description(&caller, &answer).await.expect("remote answer");

        engine.close(caller).await;
        engine.close(callee).await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_connections_are_unknown() {
        let engine = WebRtcMediaEngine::new().expect("engine");
        let handle = engine.create_connection(&[], quiet_sink()).await.expect("connection");
        let stale = ConnectionHandle::new(handle.id());
        engine.close(handle).await;
        assert_eq!(
            engine.create_offer(&stale).await,
            Err(MediaError::UnknownConnection(stale.id()))
        );
    }
}
