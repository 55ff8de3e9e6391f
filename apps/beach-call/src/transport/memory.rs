use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use super::{ConnectionState, MailboxTransport, TransportError};
use crate::protocol::{EndpointId, WireMessage};

struct Inbox {
    tx: mpsc::UnboundedSender<WireMessage>,
    rx: Option<mpsc::UnboundedReceiver<WireMessage>>,
    state: watch::Sender<ConnectionState>,
}

impl Inbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            tx,
            rx: Some(rx),
            state,
        }
    }
}

/// In-process mailbox store. Inboxes are created lazily, so messages sent
/// to an endpoint before it connects wait for it.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inboxes: Arc<RwLock<HashMap<EndpointId, Inbox>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the mailbox for `id`. Connecting the same id twice closes the
    /// earlier handle's inbound side.
    pub fn connect(&self, id: EndpointId) -> Arc<MemoryMailbox> {
        let mut guard = self.inboxes.write();
        let inbox = guard.entry(id.clone()).or_insert_with(Inbox::new);
        let rx = match inbox.rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                inbox.tx = tx;
                rx
            }
        };
        inbox.state.send_replace(ConnectionState::Connected);
        Arc::new(MemoryMailbox {
            id,
            hub: self.clone(),
            rx: AsyncMutex::new(rx),
            state: inbox.state.subscribe(),
            closed: watch::channel(false).0,
        })
    }

    /// Append a raw message to its recipient's inbox.
    pub fn deliver(&self, message: WireMessage) -> Result<(), TransportError> {
        let to = EndpointId::new(message.to.clone())
            .map_err(|err| TransportError::Send(err.to_string()))?;
        let mut guard = self.inboxes.write();
        let inbox = guard.entry(to).or_insert_with(Inbox::new);
        inbox
            .tx
            .send(message)
            .map_err(|_| TransportError::Send("recipient inbox closed".into()))
    }

    /// Simulate connection loss for `id`: its sends fail until it is
    /// brought back online. Inbound messages keep accumulating.
    pub fn set_online(&self, id: &EndpointId, online: bool) {
        let mut guard = self.inboxes.write();
        let inbox = guard.entry(id.clone()).or_insert_with(Inbox::new);
        let state = if online {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        inbox.state.send_replace(state);
    }

    fn is_online(&self, id: &EndpointId) -> bool {
        self.inboxes
            .read()
            .get(id)
            .map(|inbox| *inbox.state.borrow() == ConnectionState::Connected)
            .unwrap_or(false)
    }

    /// Number of undelivered messages waiting for `id`.
    pub fn pending(&self, id: &EndpointId) -> usize {
        self.inboxes
            .read()
            .get(id)
            .and_then(|inbox| inbox.rx.as_ref().map(|rx| rx.len()))
            .unwrap_or(0)
    }
}

pub struct MemoryMailbox {
    id: EndpointId,
    hub: MemoryHub,
    rx: AsyncMutex<mpsc::UnboundedReceiver<WireMessage>>,
    state: watch::Receiver<ConnectionState>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl MailboxTransport for MemoryMailbox {
    fn endpoint_id(&self) -> &EndpointId {
        &self.id
    }

    async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if !self.hub.is_online(&self.id) {
            return Err(TransportError::Disconnected);
        }
        self.hub.deliver(message)
    }

    async fn recv(&self) -> Result<WireMessage, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message.ok_or(TransportError::Closed),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn close(&self) {
        // A pending `recv` holds the receiver lock, so signal it instead.
        self.closed.send_replace(true);
    }
}
