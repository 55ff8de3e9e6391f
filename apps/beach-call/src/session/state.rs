use std::collections::VecDeque;
use std::fmt;

use tokio::task::AbortHandle;

use crate::media::{ConnectionHandle, LocalMedia, RemoteTrack};
use crate::protocol::{EndpointId, IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Calling,
    ReceivingCall,
    InCall,
    /// Published once on the way out of a session, then folds to `Idle`.
    Ended,
}

impl CallPhase {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallPhase::Calling | CallPhase::ReceivingCall | CallPhase::InCall
        )
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPhase::Idle => "idle",
            CallPhase::Calling => "calling",
            CallPhase::ReceivingCall => "receiving-call",
            CallPhase::InCall => "in-call",
            CallPhase::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The peer declined our call (or was busy).
    Rejected,
    /// We declined an incoming call.
    Declined,
    TimedOut,
    /// An incoming call rang out unanswered.
    Missed,
    RemoteEnded,
    LocalEnded,
    PermissionDenied,
    ConnectionLost,
    Failed(String),
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Rejected => f.write_str("rejected"),
            CallOutcome::Declined => f.write_str("declined"),
            CallOutcome::TimedOut => f.write_str("timed out"),
            CallOutcome::Missed => f.write_str("missed"),
            CallOutcome::RemoteEnded => f.write_str("ended by peer"),
            CallOutcome::LocalEnded => f.write_str("ended"),
            CallOutcome::PermissionDenied => f.write_str("permission denied"),
            CallOutcome::ConnectionLost => f.write_str("connection lost"),
            CallOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Cancellable one-shot timer. Aborted when dropped.
#[derive(Debug)]
pub(crate) struct Timer(AbortHandle);

impl Timer {
    pub(crate) fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The single call aggregate. Owned by the controller actor.
#[derive(Debug)]
pub(crate) struct CallSession {
    pub generation: u64,
    pub phase: CallPhase,
    pub peer: Option<EndpointId>,
    pub role: Option<Role>,
    pub connection: Option<ConnectionHandle>,
    pub local_media: Option<LocalMedia>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub pending_offer: Option<SessionDescription>,
    pub pending_candidates: VecDeque<IceCandidate>,
    pub remote_description_set: bool,
    pub deadline: Option<Timer>,
    pub ring_expiry: Option<Timer>,
    pub media_connected: bool,
}

impl CallSession {
    pub fn idle(generation: u64) -> Self {
        Self {
            generation,
            phase: CallPhase::Idle,
            peer: None,
            role: None,
            connection: None,
            local_media: None,
            remote_tracks: Vec::new(),
            pending_offer: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            deadline: None,
            ring_expiry: None,
            media_connected: false,
        }
    }

    pub fn is_peer(&self, from: &EndpointId) -> bool {
        self.peer.as_ref() == Some(from)
    }

    pub fn disarm_timers(&mut self) {
        self.deadline.take();
        self.ring_expiry.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn only_live_phases_are_active() {
        assert!(!CallPhase::Idle.is_active());
        assert!(!CallPhase::Ended.is_active());
        assert!(CallPhase::Calling.is_active());
        assert!(CallPhase::ReceivingCall.is_active());
        assert!(CallPhase::InCall.is_active());
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_a_timer_cancels_it() {
        let task = tokio::spawn(std::future::pending::<()>());
        let timer = Timer::new(task.abort_handle());
        drop(timer);
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
