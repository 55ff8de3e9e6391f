#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use beach_call::media::source::StaticMediaSource;
use beach_call::media::{
    ConnectionHandle, Connectivity, EngineEvent, EngineEventSink, IceServer, LocalMedia, LocalTrack,
    MediaEngine, MediaError, RemoteTrack, TrackKind,
};
use beach_call::permission::StaticPermissionGate;
use beach_call::protocol::{
    EndpointId, Envelope, IceCandidate, SdpType, SessionDescription, SignalingMessage, classify,
};
use beach_call::session::{CallController, CallDeps, CallNotice, CallSettings, SessionObserver};
use beach_call::signaling::SignalingChannel;
use beach_call::transport::memory::{MemoryHub, MemoryMailbox};
use beach_call::transport::{MailboxTransport, ReconnectPolicy};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn id(value: &str) -> EndpointId {
    EndpointId::new(value).expect("endpoint id")
}

/// Scripted media engine. Emits one local candidate per local description
/// and reports the connection as up once both descriptions are in place.
#[derive(Default)]
pub struct FakeEngine {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<u64, EngineEventSink>>,
    local_set: Mutex<HashSet<u64>>,
    remote_set: Mutex<HashSet<u64>>,
    log: Mutex<Vec<String>>,
    closed: Mutex<Vec<u64>>,
    replaced: Mutex<Vec<LocalTrack>>,
    pub fail_offer: AtomicBool,
}

impl FakeEngine {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn closed(&self) -> Vec<u64> {
        self.closed.lock().clone()
    }

    pub fn replaced(&self) -> Vec<LocalTrack> {
        self.replaced.lock().clone()
    }

    pub fn connections_created(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|entry| entry.strip_prefix("candidate:").map(str::to_string))
            .collect()
    }

    /// Inject an engine callback for the most recent connection.
    pub fn emit_latest(&self, event: EngineEvent) {
        let sink = {
            let sinks = self.sinks.lock();
            sinks
                .iter()
                .max_by_key(|(id, _)| **id)
                .map(|(_, sink)| sink.clone())
        };
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    fn emit(&self, id: u64, event: EngineEvent) {
        let sink = self.sinks.lock().get(&id).cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn known(&self, handle: &ConnectionHandle) -> Result<u64, MediaError> {
        if self.sinks.lock().contains_key(&handle.id()) {
            Ok(handle.id())
        } else {
            Err(MediaError::UnknownConnection(handle.id()))
        }
    }

    fn maybe_connected(&self, id: u64) {
        let both = self.local_set.lock().contains(&id) && self.remote_set.lock().contains(&id);
        if both {
            self.emit(
                id,
                EngineEvent::RemoteTrack(RemoteTrack {
                    id: format!("remote-audio-{id}"),
                    stream_id: format!("remote-stream-{id}"),
                    kind: TrackKind::Audio,
                }),
            );
            self.emit(id, EngineEvent::Connectivity(Connectivity::Connected));
        }
    }
}

fn kind_name(description: &SessionDescription) -> &'static str {
    match description.kind {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_connection(
        &self,
        _ice_servers: &[IceServer],
        events: EngineEventSink,
    ) -> Result<ConnectionHandle, MediaError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.sinks.lock().insert(id, events);
        self.record(format!("create:{id}"));
        Ok(ConnectionHandle::new(id))
    }

    async fn add_local_media(&self, handle: &ConnectionHandle, media: &LocalMedia) -> Result<(), MediaError> {
        self.known(handle)?;
        self.record(format!("tracks:{}", media.tracks().count()));
        Ok(())
    }

    async fn create_offer(&self, handle: &ConnectionHandle) -> Result<SessionDescription, MediaError> {
        let id = self.known(handle)?;
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("offer refused".into()));
        }
        Ok(SessionDescription::offer(format!("v=0 offer-{id}")))
    }

    async fn create_answer(&self, handle: &ConnectionHandle) -> Result<SessionDescription, MediaError> {
        let id = self.known(handle)?;
        Ok(SessionDescription::answer(format!("v=0 answer-{id}")))
    }

    async fn set_local_description(
        &self,
        handle: &ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let id = self.known(handle)?;
        self.record(format!("local:{}", kind_name(description)));
        self.local_set.lock().insert(id);
        self.emit(
            id,
            EngineEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{id} 1 udp 2122260223 10.0.0.{id} 5000{id} typ host"),
                sdp_mid: "0".into(),
                sdp_mline_index: 0,
            }),
        );
        self.maybe_connected(id);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        handle: &ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let id = self.known(handle)?;
        self.record(format!("remote:{}", kind_name(description)));
        self.remote_set.lock().insert(id);
        self.maybe_connected(id);
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        handle: &ConnectionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        self.known(handle)?;
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn replace_local_track(&self, handle: &ConnectionHandle, track: &LocalTrack) -> Result<(), MediaError> {
        self.known(handle)?;
        self.replaced.lock().push(track.clone());
        Ok(())
    }

    async fn close(&self, handle: ConnectionHandle) {
        self.sinks.lock().remove(&handle.id());
        self.closed.lock().push(handle.id());
    }
}

/// A controller wired to in-memory collaborators.
pub struct Party {
    pub id: EndpointId,
    pub controller: CallController,
    pub observer: SessionObserver,
    pub notices: broadcast::Receiver<CallNotice>,
    pub engine: Arc<FakeEngine>,
    pub media: Arc<StaticMediaSource>,
    pub mailbox: Arc<dyn MailboxTransport>,
}

pub fn party(hub: &MemoryHub, name: &str) -> Party {
    party_with(hub, name, CallSettings::default(), true)
}

pub fn party_with(hub: &MemoryHub, name: &str, settings: CallSettings, granted: bool) -> Party {
    party_over(hub.connect(id(name)), settings, granted)
}

/// A controller on an arbitrary mailbox transport.
pub fn party_over(mailbox: Arc<dyn MailboxTransport>, settings: CallSettings, granted: bool) -> Party {
    init_tracing();
    let id = mailbox.endpoint_id().clone();
    let signaling = Arc::new(SignalingChannel::new(
        mailbox.clone(),
        ReconnectPolicy::default(),
    ));
    let engine = Arc::new(FakeEngine::default());
    let media = Arc::new(StaticMediaSource::default());
    let controller = CallController::spawn(
        CallDeps {
            signaling,
            engine: engine.clone(),
            media: media.clone(),
            permissions: Arc::new(StaticPermissionGate::new(granted)),
        },
        CallSettings {
            ice_servers: Vec::new(),
            ..settings
        },
    );
    let observer = controller.observer();
    let notices = observer.notices();
    Party {
        id,
        controller,
        observer,
        notices,
        engine,
        media,
        mailbox,
    }
}

impl Party {
    pub async fn wait_phase(&self, phase: beach_call::CallPhase) {
        self.observer
            .wait_for_phase(phase)
            .await
            .expect("controller alive");
    }

    /// Next notice, skipping nothing.
    pub async fn next_notice(&mut self) -> CallNotice {
        self.notices.recv().await.expect("notice stream open")
    }

    /// Skip notices until one matches.
    pub async fn notice_matching(&mut self, predicate: impl Fn(&CallNotice) -> bool) -> CallNotice {
        loop {
            let notice = self.next_notice().await;
            if predicate(&notice) {
                return notice;
            }
        }
    }
}

/// A bare protocol speaker with no controller behind it.
pub struct RawPeer {
    pub id: EndpointId,
    pub mailbox: Arc<MemoryMailbox>,
}

impl RawPeer {
    pub fn connect(hub: &MemoryHub, name: &str) -> Self {
        Self {
            id: id(name),
            mailbox: hub.connect(id(name)),
        }
    }

    pub async fn send(&self, to: &EndpointId, message: SignalingMessage) {
        let wire = Envelope::new(self.id.clone(), to, message)
            .into_wire()
            .expect("encodable");
        self.mailbox.send(wire).await.expect("send");
    }

    pub async fn next(&self) -> Envelope {
        let wire = tokio::time::timeout(Duration::from_secs(5), self.mailbox.recv())
            .await
            .expect("message within 5s")
            .expect("mailbox open");
        classify(wire).expect("well-formed")
    }

    /// Receive until a message of the given wire type shows up.
    pub async fn next_of(&self, kind: &str) -> Envelope {
        loop {
            let envelope = self.next().await;
            if envelope.message.type_name() == kind {
                return envelope;
            }
        }
    }
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.into(),
        sdp_mid: "0".into(),
        sdp_mline_index: 0,
    }
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

/// Give queued signals time to be processed when there is nothing to wait on.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
