//! Tunnel configuration.
//!
//! Values can come from defaults, a JSON file, or builder-style setters (the
//! binary applies command-line flags through the setters). Every runtime
//! component reads its limits from one [`TunnelConfig`].
//!
//! # JSON format
//!
//! ```json
//! {
//!   "heartbeat_timeout_secs": 10,
//!   "max_datagram_size": 65507,
//!   "queue_capacity": 4096,
//!   "max_idle_buffers": 1024,
//!   "udp_override": "10.0.0.5:6000"
//! }
//! ```
//!
//! Missing fields keep their defaults.

use std::net::SocketAddrV4;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::pool::DEFAULT_MAX_IDLE_BUFFERS;
use crate::protocol::{DEFAULT_MAX_DATAGRAM_SIZE, MAX_DATAGRAM_PAYLOAD};

/// Default liveness timeout. Heartbeats are sent every half of it.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default outbound datagram queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Configuration shared by the client and the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Silence allowed on a server connection before it is closed.
    #[serde(rename = "heartbeat_timeout_secs", with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    /// Largest raw datagram captured or accepted.
    pub max_datagram_size: usize,
    /// Capacity of the client's outbound datagram queue.
    pub queue_capacity: usize,
    /// Idle buffers retained by the buffer pool.
    pub max_idle_buffers: usize,
    /// Send every tunneled datagram here instead of its original destination.
    pub udp_override: Option<SocketAddrV4>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_idle_buffers: DEFAULT_MAX_IDLE_BUFFERS,
            udp_override: None,
        }
    }
}

impl TunnelConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Set the liveness timeout.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the largest datagram size.
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    /// Set the outbound queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the number of idle pooled buffers.
    pub fn max_idle_buffers(mut self, count: usize) -> Self {
        self.max_idle_buffers = count;
        self
    }

    /// Set or clear the fixed UDP egress address.
    pub fn udp_override(mut self, addr: Option<SocketAddrV4>) -> Self {
        self.udp_override = addr;
        self
    }

    /// Period of the client heartbeat timer.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_timeout / 2
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval().is_zero() {
            return Err(TunnelError::Config(format!(
                "heartbeat timeout {:?} is too short for a heartbeat interval",
                self.heartbeat_timeout
            )));
        }
        if self.queue_capacity == 0 {
            return Err(TunnelError::Config(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_datagram_size > MAX_DATAGRAM_PAYLOAD {
            return Err(TunnelError::Config(format!(
                "max datagram size {} exceeds the frame limit of {} bytes",
                self.max_datagram_size, MAX_DATAGRAM_PAYLOAD
            )));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
