use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The only fields the relay reads; payloads pass through untouched.
#[derive(Debug, Deserialize)]
struct Routing {
    from: String,
    to: String,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message claims sender {claimed} on mailbox {actual}")]
    SenderMismatch { claimed: String, actual: String },
    #[error("message has no recipient")]
    MissingRecipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the recipient's live socket
    Pushed,
    /// Held until the recipient connects
    Held,
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// A live mailbox attachment. Frames for the endpoint arrive on `rx`.
pub struct Registration {
    pub connection_id: u64,
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// Routing table plus the held inboxes of offline endpoints.
#[derive(Clone)]
pub struct MailboxState {
    online: Arc<DashMap<String, Connection>>,
    held: Arc<DashMap<String, VecDeque<String>>>,
    max_pending: usize,
    next_connection: Arc<AtomicU64>,
}

impl MailboxState {
    pub fn new(max_pending: usize) -> Self {
        Self {
            online: Arc::new(DashMap::new()),
            held: Arc::new(DashMap::new()),
            max_pending: max_pending.max(1),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach `endpoint`, flushing anything held for it. An existing
    /// attachment for the same endpoint is replaced and its channel closed.
    pub fn connect(&self, endpoint: &str) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);

        // Holding the routing entry keeps `route` from holding a message
        // for this endpoint between the flush and the insert.
        let entry = self.online.entry(endpoint.to_string());
        if let Some((_, held)) = self.held.remove(endpoint) {
            debug!(endpoint, count = held.len(), "flushing held messages");
            for text in held {
                let _ = tx.send(text);
            }
        }
        match entry {
            Entry::Occupied(mut occupied) => {
                debug!(endpoint, "replacing existing mailbox connection");
                occupied.insert(Connection { id: connection_id, tx });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Connection { id: connection_id, tx });
            }
        }

        Registration { connection_id, rx }
    }

    /// Detach `endpoint` unless a newer connection already replaced it.
    pub fn disconnect(&self, endpoint: &str, connection_id: u64) {
        self.online
            .remove_if(endpoint, |_, connection| connection.id == connection_id);
    }

    /// Route one text frame sent by `sender`.
    pub fn route(&self, sender: &str, text: String) -> Result<Delivery, RouteError> {
        let routing: Routing = serde_json::from_str(&text)?;
        if routing.from != sender {
            return Err(RouteError::SenderMismatch {
                claimed: routing.from,
                actual: sender.to_string(),
            });
        }
        if routing.to.trim().is_empty() {
            return Err(RouteError::MissingRecipient);
        }

        match self.online.entry(routing.to.clone()) {
            Entry::Occupied(occupied) => match occupied.get().tx.send(text) {
                Ok(()) => Ok(Delivery::Pushed),
                Err(mpsc::error::SendError(text)) => {
                    // Socket is going away; keep the message for the next connect.
                    occupied.remove();
                    self.hold(&routing.to, text);
                    Ok(Delivery::Held)
                }
            },
            Entry::Vacant(_vacant) => {
                self.hold(&routing.to, text);
                Ok(Delivery::Held)
            }
        }
    }

    fn hold(&self, endpoint: &str, text: String) {
        let mut inbox = self.held.entry(endpoint.to_string()).or_default();
        if inbox.len() >= self.max_pending {
            inbox.pop_front();
            warn!(endpoint, max_pending = self.max_pending, "mailbox full; dropped oldest message");
        }
        inbox.push_back(text);
    }

    pub fn held_for(&self, endpoint: &str) -> usize {
        self.held.get(endpoint).map(|inbox| inbox.len()).unwrap_or(0)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}
