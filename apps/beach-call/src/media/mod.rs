//! Collaborators the call controller drives but does not own: the media
//! engine that negotiates and carries the session, and the local capture
//! source.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{IceCandidate, SessionDescription};

pub mod source;
pub mod webrtc_engine;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media unavailable: {0}")]
    Unavailable(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("unknown connection {0}")]
    UnknownConnection(u64),
    #[error("device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDevice {
    pub id: String,
    pub label: String,
    pub facing: CameraFacing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing: CameraFacing,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            facing: CameraFacing::Front,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub device_id: Option<String>,
    pub enabled: bool,
}

/// Captured local audio/video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalMedia {
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Opaque engine session. Not `Clone`: the controller holds the
/// only handle and gives it back through [`MediaEngine::close`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    Connectivity(Connectivity),
}

/// Where an engine reports asynchronous happenings for one connection.
#[derive(Clone)]
pub struct EngineEventSink {
    emit: Arc<dyn Fn(EngineEvent) + Send + Sync>,
}

impl EngineEventSink {
    pub fn new(emit: impl Fn(EngineEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        (self.emit)(event)
    }
}

impl fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEventSink").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: EngineEventSink,
    ) -> Result<ConnectionHandle, MediaError>;

    async fn add_local_media(&self, handle: &ConnectionHandle, media: &LocalMedia) -> Result<(), MediaError>;

    async fn create_offer(&self, handle: &ConnectionHandle) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self, handle: &ConnectionHandle) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(
        &self,
        handle: &ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn set_remote_description(
        &self,
        handle: &ConnectionHandle,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_remote_candidate(
        &self,
        handle: &ConnectionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    /// Swap the outgoing track of the same kind without renegotiating.
    async fn replace_local_track(&self, handle: &ConnectionHandle, track: &LocalTrack) -> Result<(), MediaError>;

    async fn close(&self, handle: ConnectionHandle);
}

#[async_trait]
pub trait MediaAcquisition: Send + Sync {
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;

    async fn enumerate_video_devices(&self) -> Result<Vec<VideoDevice>, MediaError>;

    async fn open_video_device(&self, device: &VideoDevice) -> Result<LocalTrack, MediaError>;

    fn set_track_enabled(&self, track: &mut LocalTrack, enabled: bool);

    fn stop_track(&self, track: &LocalTrack);
}
