//! Store-and-forward relay for beach-call mailboxes.
//!
//! Each endpoint attaches a WebSocket at `/mailbox/:endpoint_id`. Frames are
//! routed by their `to` field; frames for offline endpoints are held in a
//! bounded inbox and flushed when the endpoint next connects.

pub mod config;
pub mod mailbox;
pub mod websocket;

pub use mailbox::MailboxState;
pub use websocket::router;

use tokio::net::TcpListener;

/// Serve the relay on an already-bound listener until it fails.
pub async fn serve(listener: TcpListener, state: MailboxState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
