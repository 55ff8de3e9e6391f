//! One-to-one call signaling over mailbox transports.
//!
//! A [`session::CallController`] drives a single call at a time: it speaks
//! the signaling protocol through a [`signaling::SignalingChannel`], which
//! rides on any [`transport::MailboxTransport`], and delegates media to a
//! [`media::MediaEngine`].

pub mod config;
pub mod media;
pub mod permission;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;

pub use protocol::EndpointId;
pub use session::{CallController, CallDeps, CallError, CallNotice, CallPhase, CallSettings, CallSnapshot};
