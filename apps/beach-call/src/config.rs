use std::env;
use std::time::Duration;

use crate::media::{DEFAULT_STUN_SERVER, IceServer};
use crate::protocol::EndpointId;
use crate::session::{CallSettings, DEFAULT_ESTABLISHMENT_TIMEOUT};
use crate::transport::{RECONNECT_DELAY, ReconnectPolicy};

pub const DEFAULT_MAILBOX_URL: &str = "ws://127.0.0.1:8090";

/// beach-call configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// This process's mailbox name. Generated when not configured.
    pub endpoint_id: EndpointId,
    /// Base URL of the beach-mailbox relay
    pub mailbox_url: String,
    /// Redis URL for the polled mailbox backend
    pub redis_url: Option<String>,
    pub establishment_timeout: Duration,
    pub incoming_call_timeout: Option<Duration>,
    pub reconnect_delay: Duration,
    /// Skip public STUN servers (host candidates only)
    pub localhost_only: bool,
    pub auto_grant_permissions: bool,
}

fn flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn number(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let endpoint_id = env::var("BEACH_CALL_ENDPOINT")
            .ok()
            .and_then(|value| EndpointId::new(value).ok())
            .unwrap_or(defaults.endpoint_id);
        let mailbox_url = env::var("BEACH_CALL_MAILBOX_URL").unwrap_or(defaults.mailbox_url);
        let redis_url = env::var("BEACH_CALL_REDIS_URL").ok().filter(|url| !url.is_empty());
        let establishment_timeout = number("BEACH_CALL_ESTABLISH_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.establishment_timeout);
        // 0 keeps incoming calls ringing indefinitely
        let incoming_call_timeout = number("BEACH_CALL_RING_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let reconnect_delay = number("BEACH_CALL_RECONNECT_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_delay);

        Self {
            endpoint_id,
            mailbox_url,
            redis_url,
            establishment_timeout,
            incoming_call_timeout,
            reconnect_delay,
            localhost_only: flag("BEACH_CALL_LOCALHOST_ONLY").unwrap_or(false),
            auto_grant_permissions: flag("BEACH_CALL_AUTO_GRANT").unwrap_or(true),
        }
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        if self.localhost_only {
            Vec::new()
        } else {
            vec![IceServer::stun(DEFAULT_STUN_SERVER)]
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: self.reconnect_delay,
        }
    }

    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            establishment_timeout: self.establishment_timeout,
            incoming_call_timeout: self.incoming_call_timeout,
            ice_servers: self.ice_servers(),
            ..CallSettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_id: EndpointId::generate(),
            mailbox_url: DEFAULT_MAILBOX_URL.to_string(),
            redis_url: None,
            establishment_timeout: DEFAULT_ESTABLISHMENT_TIMEOUT,
            incoming_call_timeout: None,
            reconnect_delay: RECONNECT_DELAY,
            localhost_only: false,
            auto_grant_permissions: true,
        }
    }
}
