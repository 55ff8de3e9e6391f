use async_trait::async_trait;

/// Gate consulted before local media is acquired. A denial is handled like
/// an explicit rejection.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn has_required_permissions(&self) -> bool;

    async fn request_required_permissions(&self) -> bool;

    /// Check first, prompt only when needed.
    async fn ensure(&self) -> bool {
        self.has_required_permissions().await || self.request_required_permissions().await
    }
}

/// Fixed answer for headless processes.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissionGate {
    granted: bool,
}

impl StaticPermissionGate {
    pub fn new(granted: bool) -> Self {
        Self { granted }
    }

    pub fn granted() -> Self {
        Self::new(true)
    }

    pub fn denied() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl PermissionGate for StaticPermissionGate {
    async fn has_required_permissions(&self) -> bool {
        self.granted
    }

    async fn request_required_permissions(&self) -> bool {
        if !self.granted {
            tracing::warn!(target = "call", "camera/microphone permission denied");
        }
        self.granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn static_gate_answers_consistently() {
        assert!(StaticPermissionGate::granted().ensure().await);
        assert!(!StaticPermissionGate::denied().ensure().await);
    }
}
