//! The call controller: one actor task owns the [`CallSession`] aggregate
//! and consumes local commands, inbound signals, engine callbacks and timer
//! expiries from a single queue.
//!
//! Awaited collaborator calls (permission prompts, media acquisition,
//! description handling, sends) happen inside the actor. Anything that
//! arrives meanwhile waits in the queue, and the phase only moves once the
//! awaited work has succeeded. A failure releases whatever was attached.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::media::{
    DEFAULT_STUN_SERVER, Connectivity, EngineEvent, EngineEventSink, IceServer, MediaAcquisition,
    MediaConstraints, MediaEngine, MediaError, TrackKind,
};
use crate::permission::PermissionGate;
use crate::protocol::{EndpointId, Envelope, IceCandidate, SessionDescription, SignalingMessage};
use crate::signaling::{Signal, SignalingChannel, SignalingError};
use crate::transport::TransportError;

pub mod observer;
pub mod state;

pub use observer::{CallNotice, CallSnapshot, SessionNotifier, SessionObserver};
pub use state::{CallOutcome, CallPhase, Role};

use state::{CallSession, Timer};

pub const DEFAULT_ESTABLISHMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on remote candidates held before they can be applied, both while
/// idle and while waiting for a remote description.
const CANDIDATE_BUFFER_LIMIT: usize = 32;

#[derive(Debug, Clone)]
pub struct CallSettings {
    /// How long an outgoing call may stay unanswered.
    pub establishment_timeout: Duration,
    /// How long an incoming call may ring. `None` rings until the caller
    /// gives up.
    pub incoming_call_timeout: Option<Duration>,
    pub ice_servers: Vec<IceServer>,
    pub constraints: MediaConstraints,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            establishment_timeout: DEFAULT_ESTABLISHMENT_TIMEOUT,
            incoming_call_timeout: None,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            constraints: MediaConstraints::default(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("another call is in progress")]
    Busy,
    #[error("cannot call own endpoint")]
    SelfCall,
    #[error("no incoming call to answer")]
    NoIncomingCall,
    #[error("no active call")]
    NoActiveCall,
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("call controller stopped")]
    Stopped,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::Signaling(err.to_string())
    }
}

/// Collaborators the controller drives.
pub struct CallDeps {
    pub signaling: Arc<SignalingChannel>,
    pub engine: Arc<dyn MediaEngine>,
    pub media: Arc<dyn MediaAcquisition>,
    pub permissions: Arc<dyn PermissionGate>,
}

type Reply = oneshot::Sender<Result<(), CallError>>;

enum Command {
    Call { peer: EndpointId, reply: Reply },
    Accept { reply: Reply },
    Reject { reply: Reply },
    End { reply: Reply },
    SetMuted { muted: bool, reply: Reply },
    SetVideoEnabled { enabled: bool, reply: Reply },
    SwitchCamera { reply: Reply },
}

enum ActorEvent {
    Command(Command),
    Shutdown { reply: oneshot::Sender<()> },
    Inbound(Envelope),
    Engine { generation: u64, event: EngineEvent },
    DeadlineElapsed { generation: u64 },
    RingExpired { generation: u64 },
    ChannelFailed(TransportError),
}

type EventTx = mpsc::WeakUnboundedSender<ActorEvent>;

/// Handle to a running call actor. Dropping it stops the actor after
/// ending any active call.
pub struct CallController {
    events: mpsc::UnboundedSender<ActorEvent>,
    observer: SessionObserver,
    local_id: EndpointId,
}

impl CallController {
    pub fn spawn(deps: CallDeps, settings: CallSettings) -> Self {
        let local_id = deps.signaling.local_id().clone();
        let notifier = SessionNotifier::new(local_id.clone());
        let observer = notifier.observer();
        let (events, rx) = mpsc::unbounded_channel();
        let weak = events.downgrade();
        let forwarders = spawn_forwarders(&deps.signaling, &weak);

        let actor = Actor {
            local_id: local_id.clone(),
            settings,
            signaling: deps.signaling,
            engine: deps.engine,
            media: deps.media,
            permissions: deps.permissions,
            notifier,
            events: weak,
            forwarders,
            session: CallSession::idle(0),
            early_candidates: VecDeque::new(),
            finished_peers: HashSet::new(),
            next_generation: 1,
            fatal: None,
        };
        tokio::spawn(actor.run(rx));
        tracing::debug!(target = "call", endpoint = %local_id, "call controller started");

        Self {
            events,
            observer,
            local_id,
        }
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(ActorEvent::Command(build(reply)))
            .map_err(|_| CallError::Stopped)?;
        rx.await.map_err(|_| CallError::Stopped)?
    }

    /// Place a call. Returns once the offer is out and the phase is
    /// `Calling`.
    pub async fn call(&self, peer: EndpointId) -> Result<(), CallError> {
        self.request(|reply| Command::Call { peer, reply }).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// End whatever session is active. Declines a ringing call. A no-op when
    /// idle.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetVideoEnabled { enabled, reply })
            .await
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.request(|reply| Command::SwitchCamera { reply }).await
    }

    pub fn observer(&self) -> SessionObserver {
        self.observer.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.observer.snapshot()
    }

    /// End any active call, release the signaling subscriptions and stop the
    /// actor. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .events
            .send(ActorEvent::Shutdown { reply })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

fn spawn_forwarders(signaling: &SignalingChannel, events: &EventTx) -> Vec<JoinHandle<()>> {
    let subs = signaling.subscribe_all();
    let mut handles = vec![
        forward(subs.offers, events.clone(), SignalingMessage::Offer),
        forward(subs.answers, events.clone(), SignalingMessage::Answer),
        forward(subs.candidates, events.clone(), SignalingMessage::Candidate),
        forward(subs.call_requests, events.clone(), |()| SignalingMessage::CallRequest),
        forward(subs.call_accepted, events.clone(), |()| SignalingMessage::CallAccepted),
        forward(subs.call_rejected, events.clone(), |()| SignalingMessage::CallRejected),
        forward(subs.end_call, events.clone(), |()| SignalingMessage::EndCall),
    ];

    let mut failures = subs.failures;
    let events = events.clone();
    handles.push(tokio::spawn(async move {
        if let Ok(err) = failures.recv().await {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(ActorEvent::ChannelFailed(err));
            }
        }
    }));
    handles
}

fn forward<T>(
    mut rx: broadcast::Receiver<Signal<T>>,
    events: EventTx,
    wrap: fn(T) -> SignalingMessage,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(signal) => {
                    let Some(tx) = events.upgrade() else {
                        return;
                    };
                    let envelope = Envelope {
                        from: signal.from,
                        to: signal.to,
                        message: wrap(signal.payload),
                    };
                    if tx.send(ActorEvent::Inbound(envelope)).is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "call", skipped, "call actor fell behind on signaling");
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

struct Actor {
    local_id: EndpointId,
    settings: CallSettings,
    signaling: Arc<SignalingChannel>,
    engine: Arc<dyn MediaEngine>,
    media: Arc<dyn MediaAcquisition>,
    permissions: Arc<dyn PermissionGate>,
    notifier: SessionNotifier,
    events: EventTx,
    forwarders: Vec<JoinHandle<()>>,
    session: CallSession,
    early_candidates: VecDeque<(EndpointId, IceCandidate)>,
    /// Peers whose session ended. Their candidates are dropped until they
    /// offer again.
    finished_peers: HashSet<EndpointId>,
    next_generation: u64,
    fatal: Option<String>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ActorEvent::Shutdown { reply } => {
                    self.teardown().await;
                    let _ = reply.send(());
                    rx.close();
                    // Let queued requesters observe `Stopped`.
                    while rx.recv().await.is_some() {}
                    return;
                }
                ActorEvent::Command(command) => self.handle_command(command).await,
                ActorEvent::Inbound(envelope) => self.handle_signal(envelope).await,
                ActorEvent::Engine { generation, event } => {
                    if generation == self.session.generation && self.session.phase.is_active() {
                        self.handle_engine_event(event).await;
                    } else {
                        tracing::trace!(target = "call", generation, "dropping stale engine event");
                    }
                }
                ActorEvent::DeadlineElapsed { generation } => self.on_deadline(generation).await,
                ActorEvent::RingExpired { generation } => self.on_ring_expired(generation).await,
                ActorEvent::ChannelFailed(err) => self.on_channel_failed(err).await,
            }
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.end_active().await;
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
        self.signaling.dispose();
        tracing::debug!(target = "call", endpoint = %self.local_id, "call controller stopped");
    }

    async fn on_deadline(&mut self, generation: u64) {
        if generation == self.session.generation && self.session.phase == CallPhase::Calling {
            tracing::info!(target = "call", peer = ?self.session.peer, "call timed out");
            self.send_best_effort(SignalingMessage::EndCall).await;
            self.cleanup(CallOutcome::TimedOut).await;
        }
    }

    async fn on_ring_expired(&mut self, generation: u64) {
        if generation == self.session.generation && self.session.phase == CallPhase::ReceivingCall {
            tracing::info!(target = "call", peer = ?self.session.peer, "incoming call rang out");
            self.send_best_effort(SignalingMessage::CallRejected).await;
            self.cleanup(CallOutcome::Missed).await;
        }
    }

    async fn on_channel_failed(&mut self, err: TransportError) {
        tracing::error!(target = "call", error = %err, "signaling channel failed");
        let error = err.to_string();
        if self.fatal.is_none() {
            self.fatal = Some(error.clone());
            self.notifier.notify(CallNotice::Fatal { error });
        }
        self.cleanup(CallOutcome::ConnectionLost).await;
        self.publish();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call { peer, reply } => {
                let _ = reply.send(self.start_call(peer).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept().await);
            }
            Command::Reject { reply } => {
                let result = if self.session.phase == CallPhase::ReceivingCall {
                    self.decline(CallOutcome::Declined).await;
                    Ok(())
                } else {
                    Err(CallError::NoIncomingCall)
                };
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.end_active().await;
                let _ = reply.send(Ok(()));
            }
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_track_enabled(TrackKind::Audio, !muted));
            }
            Command::SetVideoEnabled { enabled, reply } => {
                let _ = reply.send(self.set_track_enabled(TrackKind::Video, enabled));
            }
            Command::SwitchCamera { reply } => {
                let _ = reply.send(self.switch_camera().await);
            }
        }
    }

    async fn start_call(&mut self, peer: EndpointId) -> Result<(), CallError> {
        if peer == self.local_id {
            return Err(CallError::SelfCall);
        }
        if self.session.phase.is_active() {
            tracing::debug!(target = "call", peer = %peer, phase = %self.session.phase, "ignoring call while busy");
            return Err(CallError::Busy);
        }
        if !self.permissions.ensure().await {
            self.notifier.notify(CallNotice::PermissionDenied { peer });
            return Err(CallError::PermissionDenied);
        }

        self.early_candidates.clear();
        self.finished_peers.remove(&peer);
        let generation = self.bump_generation();
        let mut session = CallSession::idle(generation);
        session.peer = Some(peer.clone());
        session.role = Some(Role::Caller);

        if let Err(err) = self.prepare_offer(&mut session, &peer).await {
            tracing::warn!(target = "call", peer = %peer, error = %err, "call setup failed");
            self.release(session).await;
            self.notifier.notify(CallNotice::Ended {
                peer,
                outcome: CallOutcome::Failed(err.to_string()),
            });
            return Err(err);
        }

        session.phase = CallPhase::Calling;
        session.deadline = Some(self.arm(
            self.settings.establishment_timeout,
            ActorEvent::DeadlineElapsed { generation },
        ));
        self.session = session;
        tracing::info!(target = "call", peer = %peer, generation, "calling");
        self.publish();
        Ok(())
    }

    async fn prepare_offer(&self, session: &mut CallSession, peer: &EndpointId) -> Result<(), CallError> {
        let media = session
            .local_media
            .insert(self.media.acquire_local_media(&self.settings.constraints).await?);
        let handle = session.connection.insert(
            self.engine
                .create_connection(&self.settings.ice_servers, self.engine_sink(session.generation))
                .await?,
        );
        self.engine.add_local_media(handle, media).await?;
        let offer = self.engine.create_offer(handle).await?;
        self.engine.set_local_description(handle, &offer).await?;
        self.signaling.send_offer(peer, offer).await?;
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        if self.session.phase != CallPhase::ReceivingCall {
            return Err(CallError::NoIncomingCall);
        }
        self.session.ring_expiry.take();
        let Some(peer) = self.session.peer.clone() else {
            return Err(CallError::NoIncomingCall);
        };

        if !self.permissions.ensure().await {
            self.notifier.notify(CallNotice::PermissionDenied { peer });
            self.decline(CallOutcome::PermissionDenied).await;
            return Err(CallError::PermissionDenied);
        }

        if let Err(err) = self.prepare_answer(&peer).await {
            tracing::warn!(target = "call", peer = %peer, error = %err, "accepting call failed");
            self.send_best_effort(SignalingMessage::CallRejected).await;
            self.cleanup(CallOutcome::Failed(err.to_string())).await;
            return Err(err);
        }

        self.session.phase = CallPhase::InCall;
        tracing::info!(target = "call", peer = %peer, "call accepted");
        self.publish();
        self.notifier.notify(CallNotice::Accepted { peer });
        Ok(())
    }

    async fn prepare_answer(&mut self, peer: &EndpointId) -> Result<(), CallError> {
        let offer = self
            .session
            .pending_offer
            .take()
            .ok_or(CallError::NoIncomingCall)?;
        let sink = self.engine_sink(self.session.generation);
        let media = self
            .media
            .acquire_local_media(&self.settings.constraints)
            .await?;
        let media = self.session.local_media.insert(media);
        let handle = self.session.connection.insert(
            self.engine
                .create_connection(&self.settings.ice_servers, sink)
                .await?,
        );
        self.engine.add_local_media(handle, media).await?;
        self.engine.set_remote_description(handle, &offer).await?;
        self.session.remote_description_set = true;
        self.flush_candidates().await;

        let Some(handle) = self.session.connection.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        let answer = self.engine.create_answer(handle).await?;
        self.engine.set_local_description(handle, &answer).await?;
        self.signaling.send_call_accepted(peer).await?;
        self.signaling.send_answer(peer, answer).await?;
        Ok(())
    }

    /// Reject the ringing call and return to idle.
    async fn decline(&mut self, outcome: CallOutcome) {
        self.send_best_effort(SignalingMessage::CallRejected).await;
        self.cleanup(outcome).await;
    }

    /// Local end of whatever is active.
    async fn end_active(&mut self) {
        match self.session.phase {
            CallPhase::ReceivingCall => self.decline(CallOutcome::Declined).await,
            CallPhase::Calling | CallPhase::InCall => {
                self.send_best_effort(SignalingMessage::EndCall).await;
                self.cleanup(CallOutcome::LocalEnded).await;
            }
            CallPhase::Idle | CallPhase::Ended => {}
        }
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<(), CallError> {
        let media = self.session.local_media.as_mut().ok_or(CallError::NoActiveCall)?;
        let track = match kind {
            TrackKind::Audio => media.audio.as_mut(),
            TrackKind::Video => media.video.as_mut(),
        };
        let track = track
            .ok_or_else(|| MediaError::Unavailable(format!("no local {kind:?} track")))?;
        self.media.set_track_enabled(track, enabled);
        self.publish();
        Ok(())
    }

    async fn switch_camera(&mut self) -> Result<(), CallError> {
        let current = self
            .session
            .local_media
            .as_ref()
            .and_then(|media| media.video.clone())
            .ok_or(CallError::NoActiveCall)?;
        let devices = self.media.enumerate_video_devices().await?;
        if devices.len() < 2 {
            return Err(MediaError::Device("no other camera available".into()).into());
        }
        let position = devices
            .iter()
            .position(|device| Some(&device.id) == current.device_id.as_ref())
            .unwrap_or(0);
        let next = &devices[(position + 1) % devices.len()];

        let mut track = self.media.open_video_device(next).await?;
        self.media.set_track_enabled(&mut track, current.enabled);
        if let Some(handle) = self.session.connection.as_ref() {
            if let Err(err) = self.engine.replace_local_track(handle, &track).await {
                self.media.stop_track(&track);
                return Err(err.into());
            }
        }
        self.media.stop_track(&current);
        if let Some(media) = self.session.local_media.as_mut() {
            media.video = Some(track);
        }
        tracing::debug!(target = "call", device = %next.id, "switched camera");
        self.publish();
        Ok(())
    }

    async fn handle_signal(&mut self, envelope: Envelope) {
        let Envelope { from, message, .. } = envelope;
        match message {
            SignalingMessage::Offer(offer) => self.on_offer(from, offer).await,
            SignalingMessage::Answer(answer) => self.on_answer(from, answer).await,
            SignalingMessage::Candidate(candidate) => self.on_candidate(from, candidate).await,
            SignalingMessage::CallRequest => {
                if self.session.phase.is_active() && !self.session.is_peer(&from) {
                    self.reject_busy(&from).await;
                } else {
                    tracing::debug!(target = "call", from = %from, "call request received");
                }
            }
            SignalingMessage::CallAccepted => {
                if self.session.phase == CallPhase::Calling && self.session.is_peer(&from) {
                    self.notifier.notify(CallNotice::Accepted { peer: from });
                }
            }
            SignalingMessage::CallRejected => {
                if self.session.phase == CallPhase::Calling && self.session.is_peer(&from) {
                    tracing::info!(target = "call", peer = %from, "call rejected by peer");
                    self.cleanup(CallOutcome::Rejected).await;
                } else {
                    tracing::debug!(target = "call", from = %from, "ignoring stray call-rejected");
                }
            }
            SignalingMessage::EndCall => {
                if self.session.phase.is_active() && self.session.is_peer(&from) {
                    tracing::info!(target = "call", peer = %from, "call ended by peer");
                    self.cleanup(CallOutcome::RemoteEnded).await;
                } else {
                    tracing::debug!(target = "call", from = %from, "ignoring stray end-call");
                }
            }
        }
    }

    async fn on_offer(&mut self, from: EndpointId, offer: SessionDescription) {
        match self.session.phase {
            CallPhase::Idle | CallPhase::Ended => {
                let generation = self.bump_generation();
                let mut session = CallSession::idle(generation);
                session.phase = CallPhase::ReceivingCall;
                session.peer = Some(from.clone());
                session.role = Some(Role::Callee);
                session.pending_offer = Some(offer);
                self.finished_peers.remove(&from);
                session.pending_candidates = self.take_early_candidates(&from);
                if let Some(timeout) = self.settings.incoming_call_timeout {
                    session.ring_expiry = Some(self.arm(timeout, ActorEvent::RingExpired { generation }));
                }
                self.session = session;
                tracing::info!(target = "call", peer = %from, generation, "incoming call");
                self.publish();
                self.notifier.notify(CallNotice::Incoming { peer: from });
            }
            CallPhase::ReceivingCall | CallPhase::InCall if self.session.is_peer(&from) => {
                tracing::debug!(target = "call", peer = %from, phase = %self.session.phase, "ignoring duplicate offer");
            }
            CallPhase::Calling | CallPhase::ReceivingCall | CallPhase::InCall => {
                self.reject_busy(&from).await;
            }
        }
    }

    async fn reject_busy(&mut self, from: &EndpointId) {
        tracing::info!(target = "call", from = %from, phase = %self.session.phase, "rejecting call while busy");
        if let Err(err) = self.signaling.send_call_rejected(from).await {
            tracing::debug!(target = "call", from = %from, error = %err, "busy rejection not delivered");
        }
        self.notifier.notify(CallNotice::BusyRejected { peer: from.clone() });
    }

    async fn on_answer(&mut self, from: EndpointId, answer: SessionDescription) {
        if self.session.phase != CallPhase::Calling || !self.session.is_peer(&from) {
            tracing::debug!(target = "call", from = %from, phase = %self.session.phase, "ignoring answer");
            return;
        }
        self.session.deadline.take();
        let result = match self.session.connection.as_ref() {
            Some(handle) => self.engine.set_remote_description(handle, &answer).await,
            None => Err(MediaError::Negotiation("no connection for answer".into())),
        };
        if let Err(err) = result {
            tracing::warn!(target = "call", peer = %from, error = %err, "failed to apply answer");
            self.send_best_effort(SignalingMessage::EndCall).await;
            self.cleanup(CallOutcome::Failed(err.to_string())).await;
            return;
        }
        self.session.remote_description_set = true;
        self.flush_candidates().await;
        self.session.phase = CallPhase::InCall;
        tracing::info!(target = "call", peer = %from, "call answered");
        self.publish();
    }

    async fn on_candidate(&mut self, from: EndpointId, candidate: IceCandidate) {
        if !self.session.phase.is_active() {
            if self.finished_peers.contains(&from) {
                tracing::trace!(target = "call", from = %from, "dropping candidate from a finished session");
                return;
            }
            // Streams are delivered independently, so a candidate can
            // overtake the offer it belongs to.
            if self.early_candidates.len() == CANDIDATE_BUFFER_LIMIT {
                self.early_candidates.pop_front();
            }
            self.early_candidates.push_back((from, candidate));
            return;
        }
        if !self.session.is_peer(&from) {
            tracing::trace!(target = "call", from = %from, "dropping candidate");
            return;
        }
        match self.session.connection.as_ref() {
            Some(handle) if self.session.remote_description_set => {
                if let Err(err) = self.engine.add_remote_candidate(handle, &candidate).await {
                    tracing::debug!(target = "call", error = %err, "remote candidate rejected");
                }
            }
            _ => {
                let pending = &mut self.session.pending_candidates;
                if pending.len() == CANDIDATE_BUFFER_LIMIT {
                    pending.pop_front();
                }
                pending.push_back(candidate);
            }
        }
    }

    fn take_early_candidates(&mut self, from: &EndpointId) -> VecDeque<IceCandidate> {
        let (matching, _stale): (Vec<_>, Vec<_>) = self
            .early_candidates
            .drain(..)
            .partition(|(sender, _)| sender == from);
        matching.into_iter().map(|(_, candidate)| candidate).collect()
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.session.pending_candidates);
        let Some(handle) = self.session.connection.as_ref() else {
            return;
        };
        for candidate in pending {
            if let Err(err) = self.engine.add_remote_candidate(handle, &candidate).await {
                tracing::debug!(target = "call", error = %err, "buffered candidate rejected");
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                let Some(peer) = self.session.peer.clone() else {
                    return;
                };
                if let Err(err) = self.signaling.send_candidate(&peer, candidate).await {
                    tracing::debug!(target = "call", peer = %peer, error = %err, "local candidate not delivered");
                }
            }
            EngineEvent::RemoteTrack(track) => {
                tracing::debug!(target = "call", track = %track.id, kind = ?track.kind, "remote track attached");
                self.session.remote_tracks.push(track);
                self.publish();
            }
            EngineEvent::Connectivity(Connectivity::Connected) => {
                if !self.session.media_connected {
                    self.session.media_connected = true;
                    self.publish();
                    if let Some(peer) = self.session.peer.clone() {
                        self.notifier.notify(CallNotice::Connected { peer });
                    }
                }
            }
            EngineEvent::Connectivity(state @ (Connectivity::Failed | Connectivity::Disconnected)) => {
                if self.session.phase == CallPhase::InCall {
                    tracing::warn!(target = "call", state = ?state, "media connection lost");
                    self.send_best_effort(SignalingMessage::EndCall).await;
                    self.cleanup(CallOutcome::ConnectionLost).await;
                }
            }
            EngineEvent::Connectivity(_) => {}
        }
    }

    async fn send_best_effort(&self, message: SignalingMessage) {
        let Some(peer) = self.session.peer.as_ref() else {
            return;
        };
        let kind = message.type_name();
        if let Err(err) = self.signaling.send(peer, message).await {
            tracing::debug!(target = "call", peer = %peer, kind, error = %err, "best-effort signal not delivered");
        }
    }

    /// Single exit from any active phase. Repeated calls are no-ops.
    async fn cleanup(&mut self, outcome: CallOutcome) {
        if !self.session.phase.is_active() {
            return;
        }
        let generation = self.session.generation;
        let mut session = std::mem::replace(&mut self.session, CallSession::idle(generation));
        let peer = session.peer.clone();
        let role = session.role;
        if let Some(peer) = &peer {
            self.early_candidates.retain(|(sender, _)| sender != peer);
            self.finished_peers.insert(peer.clone());
        }
        session.phase = CallPhase::Ended;
        self.release(session).await;

        tracing::info!(target = "call", peer = ?peer, outcome = %outcome, "call ended");
        self.notifier.publish(CallSnapshot {
            phase: CallPhase::Ended,
            peer: peer.clone(),
            role,
            fatal: self.fatal.clone(),
            ..CallSnapshot::idle(self.local_id.clone())
        });
        self.publish();
        if let Some(peer) = peer {
            self.notifier.notify(CallNotice::Ended { peer, outcome });
        }
    }

    async fn release(&self, mut session: CallSession) {
        session.disarm_timers();
        if let Some(handle) = session.connection.take() {
            self.engine.close(handle).await;
        }
        if let Some(media) = session.local_media.take() {
            for track in media.tracks() {
                self.media.stop_track(track);
            }
        }
        session.remote_tracks.clear();
        session.pending_candidates.clear();
    }

    fn publish(&self) {
        let session = &self.session;
        let audio = session.local_media.as_ref().and_then(|media| media.audio.as_ref());
        let video = session.local_media.as_ref().and_then(|media| media.video.as_ref());
        self.notifier.publish(CallSnapshot {
            phase: session.phase,
            local_id: self.local_id.clone(),
            peer: session.peer.clone(),
            role: session.role,
            has_local_media: session.local_media.is_some(),
            has_remote_media: !session.remote_tracks.is_empty(),
            muted: audio.map(|track| !track.enabled).unwrap_or(false),
            video_enabled: video.map(|track| track.enabled).unwrap_or(true),
            media_connected: session.media_connected,
            fatal: self.fatal.clone(),
        });
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn engine_sink(&self, generation: u64) -> EngineEventSink {
        let events = self.events.clone();
        EngineEventSink::new(move |event| {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(ActorEvent::Engine { generation, event });
            }
        })
    }

    fn arm(&self, delay: Duration, event: ActorEvent) -> Timer {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(event);
            }
        });
        Timer::new(task.abort_handle())
    }
}
