//! Typed signaling on top of a [`MailboxTransport`].
//!
//! Inbound raw messages are classified and fanned out to one broadcast
//! stream per message type. The inbound pump starts with the first
//! subscription, so anything that arrives earlier stays in the mailbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::protocol::{
    EndpointId, Envelope, IceCandidate, ProtocolError, SessionDescription, SignalingMessage,
    classify,
};
use crate::transport::{MailboxTransport, ReconnectPolicy, TransportError};

const STREAM_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("signaling channel disposed")]
    Disposed,
}

/// A typed inbound message with its addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal<T> {
    pub from: EndpointId,
    pub to: String,
    pub payload: T,
}

/// One receiver per stream, taken together.
pub struct Subscriptions {
    pub offers: broadcast::Receiver<Signal<SessionDescription>>,
    pub answers: broadcast::Receiver<Signal<SessionDescription>>,
    pub candidates: broadcast::Receiver<Signal<IceCandidate>>,
    pub call_requests: broadcast::Receiver<Signal<()>>,
    pub call_accepted: broadcast::Receiver<Signal<()>>,
    pub call_rejected: broadcast::Receiver<Signal<()>>,
    pub end_call: broadcast::Receiver<Signal<()>>,
    pub failures: broadcast::Receiver<TransportError>,
}

struct Streams {
    offer: broadcast::Sender<Signal<SessionDescription>>,
    answer: broadcast::Sender<Signal<SessionDescription>>,
    candidate: broadcast::Sender<Signal<IceCandidate>>,
    call_request: broadcast::Sender<Signal<()>>,
    call_accepted: broadcast::Sender<Signal<()>>,
    call_rejected: broadcast::Sender<Signal<()>>,
    end_call: broadcast::Sender<Signal<()>>,
    failures: broadcast::Sender<TransportError>,
}

impl Streams {
    fn new() -> Self {
        Self {
            offer: broadcast::channel(STREAM_CAPACITY).0,
            answer: broadcast::channel(STREAM_CAPACITY).0,
            candidate: broadcast::channel(STREAM_CAPACITY).0,
            call_request: broadcast::channel(STREAM_CAPACITY).0,
            call_accepted: broadcast::channel(STREAM_CAPACITY).0,
            call_rejected: broadcast::channel(STREAM_CAPACITY).0,
            end_call: broadcast::channel(STREAM_CAPACITY).0,
            failures: broadcast::channel(4).0,
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope { from, to, message } = envelope;
        // A send error only means nobody is listening to that type.
        match message {
            SignalingMessage::Offer(desc) => {
                let _ = self.offer.send(Signal { from, to, payload: desc });
            }
            SignalingMessage::Answer(desc) => {
                let _ = self.answer.send(Signal { from, to, payload: desc });
            }
            SignalingMessage::Candidate(candidate) => {
                let _ = self.candidate.send(Signal {
                    from,
                    to,
                    payload: candidate,
                });
            }
            SignalingMessage::CallRequest => {
                let _ = self.call_request.send(Signal { from, to, payload: () });
            }
            SignalingMessage::CallAccepted => {
                let _ = self.call_accepted.send(Signal { from, to, payload: () });
            }
            SignalingMessage::CallRejected => {
                let _ = self.call_rejected.send(Signal { from, to, payload: () });
            }
            SignalingMessage::EndCall => {
                let _ = self.end_call.send(Signal { from, to, payload: () });
            }
        }
    }
}

pub struct SignalingChannel {
    transport: Arc<dyn MailboxTransport>,
    policy: ReconnectPolicy,
    streams: Arc<RwLock<Option<Streams>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn MailboxTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            streams: Arc::new(RwLock::new(Some(Streams::new()))),
            pump: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> &EndpointId {
        self.transport.endpoint_id()
    }

    pub fn transport(&self) -> &Arc<dyn MailboxTransport> {
        &self.transport
    }

    /// Serialize `message` and hand it to the transport, addressed to `to`.
    pub async fn send(&self, to: &EndpointId, message: SignalingMessage) -> Result<(), SignalingError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SignalingError::Disposed);
        }
        let kind = message.type_name();
        let wire = Envelope::new(self.local_id().clone(), to, message).into_wire()?;
        self.transport.send(wire).await?;
        tracing::debug!(target = "signaling", kind, to = %to, "signal sent");
        Ok(())
    }

    pub async fn send_offer(&self, to: &EndpointId, offer: SessionDescription) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::Offer(offer)).await
    }

    pub async fn send_answer(&self, to: &EndpointId, answer: SessionDescription) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::Answer(answer)).await
    }

    pub async fn send_candidate(&self, to: &EndpointId, candidate: IceCandidate) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::Candidate(candidate)).await
    }

    pub async fn send_call_request(&self, to: &EndpointId) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::CallRequest).await
    }

    pub async fn send_call_accepted(&self, to: &EndpointId) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::CallAccepted).await
    }

    pub async fn send_call_rejected(&self, to: &EndpointId) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::CallRejected).await
    }

    pub async fn send_end_call(&self, to: &EndpointId) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::EndCall).await
    }

    pub fn subscribe_offers(&self) -> broadcast::Receiver<Signal<SessionDescription>> {
        self.subscribe_with(|streams| streams.offer.subscribe())
    }

    pub fn subscribe_answers(&self) -> broadcast::Receiver<Signal<SessionDescription>> {
        self.subscribe_with(|streams| streams.answer.subscribe())
    }

    pub fn subscribe_candidates(&self) -> broadcast::Receiver<Signal<IceCandidate>> {
        self.subscribe_with(|streams| streams.candidate.subscribe())
    }

    pub fn subscribe_call_requests(&self) -> broadcast::Receiver<Signal<()>> {
        self.subscribe_with(|streams| streams.call_request.subscribe())
    }

    pub fn subscribe_call_accepted(&self) -> broadcast::Receiver<Signal<()>> {
        self.subscribe_with(|streams| streams.call_accepted.subscribe())
    }

    pub fn subscribe_call_rejected(&self) -> broadcast::Receiver<Signal<()>> {
        self.subscribe_with(|streams| streams.call_rejected.subscribe())
    }

    pub fn subscribe_end_call(&self) -> broadcast::Receiver<Signal<()>> {
        self.subscribe_with(|streams| streams.end_call.subscribe())
    }

    /// Fatal transport failures. At most one is ever published.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<TransportError> {
        self.subscribe_with(|streams| streams.failures.subscribe())
    }

    /// Subscribe to every stream before the pump can dispatch anything.
    pub fn subscribe_all(&self) -> Subscriptions {
        let subscriptions = {
            let guard = self.streams.read();
            match guard.as_ref() {
                Some(streams) => Subscriptions {
                    offers: streams.offer.subscribe(),
                    answers: streams.answer.subscribe(),
                    candidates: streams.candidate.subscribe(),
                    call_requests: streams.call_request.subscribe(),
                    call_accepted: streams.call_accepted.subscribe(),
                    call_rejected: streams.call_rejected.subscribe(),
                    end_call: streams.end_call.subscribe(),
                    failures: streams.failures.subscribe(),
                },
                None => Subscriptions {
                    offers: broadcast::channel(1).1,
                    answers: broadcast::channel(1).1,
                    candidates: broadcast::channel(1).1,
                    call_requests: broadcast::channel(1).1,
                    call_accepted: broadcast::channel(1).1,
                    call_rejected: broadcast::channel(1).1,
                    end_call: broadcast::channel(1).1,
                    failures: broadcast::channel(1).1,
                },
            }
        };
        self.ensure_pump();
        subscriptions
    }

    fn subscribe_with<T: Clone>(
        &self,
        pick: impl FnOnce(&Streams) -> broadcast::Receiver<T>,
    ) -> broadcast::Receiver<T> {
        let rx = {
            let guard = self.streams.read();
            match guard.as_ref() {
                Some(streams) => pick(streams),
                // Disposed: hand out a receiver that is already closed.
                None => broadcast::channel(1).1,
            }
        };
        self.ensure_pump();
        rx
    }

    fn ensure_pump(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let streams = Arc::clone(&self.streams);
        let policy = self.policy;
        *pump = Some(tokio::spawn(run_pump(transport, streams, policy)));
    }

    /// Stop the inbound pump and close every stream. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.streams.write().take();
        tracing::debug!(target = "signaling", endpoint = %self.local_id(), "signaling channel disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run_pump(
    transport: Arc<dyn MailboxTransport>,
    streams: Arc<RwLock<Option<Streams>>>,
    policy: ReconnectPolicy,
) {
    loop {
        match transport.recv().await {
            Ok(wire) => {
                let kind = wire.kind.clone();
                match classify(wire) {
                    Ok(envelope) => {
                        tracing::trace!(target = "signaling", kind = %kind, from = %envelope.from, "signal received");
                        match streams.read().as_ref() {
                            Some(streams) => streams.dispatch(envelope),
                            None => return,
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "signaling", kind = %kind, error = %err, "dropping inbound message");
                    }
                }
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(
                    target = "signaling",
                    error = %err,
                    delay_ms = policy.delay.as_millis() as u64,
                    "mailbox unavailable; waiting to resume"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => {
                tracing::warn!(target = "signaling", error = %err, "signaling pump stopped");
                if let Some(streams) = streams.read().as_ref() {
                    let _ = streams.failures.send(err);
                }
                return;
            }
        }
    }
}
