//! Runtime configuration
//!
//! Defaults work for most hosts. Each value can be overridden from the
//! environment, which is how the binary is configured:
//!
//! | Variable                     | Field               | Default |
//! |------------------------------|---------------------|---------|
//! | `CONNTRACK_RECV_TIMEOUT_MS`  | `recv_timeout_ms`   | 1000    |
//! | `CONNTRACK_RECV_BUFFER`      | `recv_buffer_bytes` | 262144  |
//! | `CONNTRACK_QUEUE_DEPTH`      | `event_queue_depth` | 1       |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_RECV_BUFFER_BYTES: usize = 256 * 1024;
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 1;

/// Smallest usable receive timeout; `SO_RCVTIMEO` of zero means "never"
pub const MIN_RECV_TIMEOUT_MS: u64 = 1;

/// Socket and streaming parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConntrackConfig {
    /// `SO_RCVTIMEO` in milliseconds
    ///
    /// Bounds how long a snapshot waits for the rest of a dump, and how
    /// often a follow worker wakes up to check whether it was stopped.
    /// Zero is raised to [`MIN_RECV_TIMEOUT_MS`].
    pub recv_timeout_ms: u64,

    /// `SO_RCVBUF` request in bytes
    ///
    /// Event bursts larger than this make the kernel drop messages
    /// (reported as `ConntrackError::Overrun`).
    pub recv_buffer_bytes: usize,

    /// Capacity of the channel between the follow worker and its consumer
    ///
    /// At least 1; zero is raised to 1.
    pub event_queue_depth: usize,
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            recv_buffer_bytes: DEFAULT_RECV_BUFFER_BYTES,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
        }
    }
}

impl ConntrackConfig {
    /// Defaults, overridden by `CONNTRACK_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        override_from(&lookup, "CONNTRACK_RECV_TIMEOUT_MS", &mut config.recv_timeout_ms);
        override_from(&lookup, "CONNTRACK_RECV_BUFFER", &mut config.recv_buffer_bytes);
        override_from(&lookup, "CONNTRACK_QUEUE_DEPTH", &mut config.event_queue_depth);

        if config.recv_timeout_ms < MIN_RECV_TIMEOUT_MS {
            warn!(
                key = "CONNTRACK_RECV_TIMEOUT_MS",
                "a zero receive timeout never expires, using {MIN_RECV_TIMEOUT_MS} ms"
            );
            config.recv_timeout_ms = MIN_RECV_TIMEOUT_MS;
        }
        if config.event_queue_depth == 0 {
            warn!(key = "CONNTRACK_QUEUE_DEPTH", "queue depth must be at least 1, using 1");
            config.event_queue_depth = 1;
        }
        config
    }

    /// Receive timeout actually applied to sockets, never zero
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.max(MIN_RECV_TIMEOUT_MS))
    }

    /// Follow channel capacity actually used, never zero
    pub fn queue_depth(&self) -> usize {
        self.event_queue_depth.max(1)
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring malformed configuration value"),
    }
}
