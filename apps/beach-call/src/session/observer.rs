//! Observable projection of the call session.
//!
//! Snapshots go out on a `watch` channel and are only published when they
//! change. Discrete events (ringing, outcomes, failures) go out on a
//! broadcast notice stream.

use std::future::Future;

use tokio::sync::{broadcast, watch};

use super::state::{CallOutcome, CallPhase, Role};
use crate::protocol::EndpointId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub local_id: EndpointId,
    pub peer: Option<EndpointId>,
    pub role: Option<Role>,
    pub has_local_media: bool,
    pub has_remote_media: bool,
    pub muted: bool,
    pub video_enabled: bool,
    pub media_connected: bool,
    pub fatal: Option<String>,
}

impl CallSnapshot {
    pub fn idle(local_id: EndpointId) -> Self {
        Self {
            phase: CallPhase::Idle,
            local_id,
            peer: None,
            role: None,
            has_local_media: false,
            has_remote_media: false,
            muted: false,
            video_enabled: true,
            media_connected: false,
            fatal: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    Incoming { peer: EndpointId },
    Accepted { peer: EndpointId },
    Connected { peer: EndpointId },
    /// An attempt from `peer` was turned away because a session is active.
    BusyRejected { peer: EndpointId },
    PermissionDenied { peer: EndpointId },
    Ended { peer: EndpointId, outcome: CallOutcome },
    Fatal { error: String },
}

pub struct SessionNotifier {
    snapshot: watch::Sender<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
}

impl SessionNotifier {
    pub fn new(local_id: EndpointId) -> Self {
        let (snapshot, _) = watch::channel(CallSnapshot::idle(local_id));
        let (notices, _) = broadcast::channel(64);
        Self { snapshot, notices }
    }

    /// Publish `next` unless it equals the current snapshot.
    pub fn publish(&self, next: CallSnapshot) -> bool {
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub fn notify(&self, notice: CallNotice) {
        tracing::debug!(target = "call", notice = ?notice, "call notice");
        let _ = self.notices.send(notice);
    }

    pub fn current(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn observer(&self) -> SessionObserver {
        SessionObserver {
            snapshot: self.snapshot.subscribe(),
            notices: self.notices.clone(),
        }
    }
}

/// Read side handed to UI code, ringtone triggers and tests.
#[derive(Clone)]
pub struct SessionObserver {
    snapshot: watch::Receiver<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
}

impl SessionObserver {
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    /// Resolve once a published snapshot satisfies `predicate`.
    pub fn wait_for(
        &self,
        mut predicate: impl FnMut(&CallSnapshot) -> bool + Send,
    ) -> impl Future<Output = Option<CallSnapshot>> + Send {
        let mut rx = self.snapshot.clone();
        async move {
            rx.wait_for(|snapshot| predicate(snapshot))
                .await
                .ok()
                .map(|snapshot| snapshot.clone())
        }
    }

    pub fn wait_for_phase(&self, phase: CallPhase) -> impl Future<Output = Option<CallSnapshot>> + Send {
        self.wait_for(move |snapshot| snapshot.phase == phase)
    }
}
