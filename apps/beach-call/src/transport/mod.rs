use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::protocol::{EndpointId, WireMessage};

pub mod memory;
#[cfg(feature = "redis-mailbox")]
pub mod redis_log;
pub mod websocket;

/// Fixed delay between reconnect attempts. There is no backoff.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("mailbox connect failed: {0}")]
    Connect(String),
    #[error("mailbox send failed: {0}")]
    Send(String),
    #[error("mailbox disconnected")]
    Disconnected,
    #[error("mailbox unauthorized: {0}")]
    Unauthorized(String),
    #[error("mailbox closed")]
    Closed,
}

impl TransportError {
    /// Whether waiting for the adapter to reconnect can resolve the error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected | TransportError::Connect(_) | TransportError::Send(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// How a consumer of a mailbox reacts to a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: RECONNECT_DELAY,
        }
    }
}

/// Per-recipient mailbox delivery.
///
/// `recv` yields messages addressed to [`MailboxTransport::endpoint_id`] in
/// the order the backing store hands them over. A message returned from
/// `recv` has already been consumed at the transport level and is never
/// yielded again. Adapters reconnect on their own; while they do, `recv`
/// either waits or reports [`TransportError::Disconnected`], which callers
/// treat as "retry after [`ReconnectPolicy::delay`]".
#[async_trait]
pub trait MailboxTransport: Send + Sync {
    fn endpoint_id(&self) -> &EndpointId;

    /// Append a message to `message.to`'s inbox. Fails rather than dropping.
    async fn send(&self, message: WireMessage) -> Result<(), TransportError>;

    async fn recv(&self) -> Result<WireMessage, TransportError>;

    fn state(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self);
}
