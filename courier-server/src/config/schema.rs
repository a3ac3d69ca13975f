//! Configuration schema structs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub stats: StatsConfig,
}

/// Client-facing listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address devices connect to (default: 0.0.0.0:7500)
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7500".into(),
        }
    }
}

/// Per-session delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound messages buffered per session before enqueue reports a full queue
    pub send_queue_capacity: usize,
    /// How long queued messages are still written after a close request
    pub close_flush_timeout_ms: u64,
}

impl SessionConfig {
    pub const MIN_QUEUE_CAPACITY: usize = 1;
    pub const MAX_QUEUE_CAPACITY: usize = 65536;
    pub const MAX_FLUSH_TIMEOUT_MS: u64 = 10_000;

    pub fn close_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.close_flush_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            close_flush_timeout_ms: 500,
        }
    }
}

/// Operational HTTP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Serve /metrics, /info and /clients (default: true)
    pub enabled: bool,
    /// Bind address, loopback by default
    pub listen_addr: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9750".into(),
        }
    }
}
