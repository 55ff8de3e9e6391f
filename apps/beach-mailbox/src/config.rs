use std::env;

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_MAX_PENDING: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Messages held per offline endpoint before the oldest are dropped
    pub max_pending: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("BEACH_MAILBOX_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            max_pending: env::var("BEACH_MAILBOX_MAX_PENDING")
                .ok()
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_PENDING),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}
