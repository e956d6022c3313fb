//! Stack-wide tunables.
//!
//! Every field has a default so a partial JSON document is enough:
//!
//! ```
//! let config = simnet::StackConfig::from_json(r#"{ "default_ttl": 32 }"#).unwrap();
//! assert_eq!(config.default_ttl, 32);
//! assert_eq!(config.ephemeral_port_start, 49152);
//! ```

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Link type written into capture files for Ethernet II frames.
pub const LINKTYPE_ETHERNET: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// TTL stamped on locally originated IPv4 packets.
    pub default_ttl: u8,
    pub ephemeral_port_start: u16,
    pub ephemeral_port_end: u16,
    /// Handshake wait used by `connect_tcp_conn` when the caller gives none.
    pub connect_timeout_ms: u64,
    /// Datagrams held per UDP socket before tail drop.
    pub udp_queue_limit: usize,
    /// Completed connections held per listener before SYNs are ignored.
    pub tcp_backlog: usize,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub snaplen: u32,
    pub link_type: u32,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            default_ttl: 64,
            ephemeral_port_start: 49152,
            ephemeral_port_end: 65535,
            connect_timeout_ms: 3000,
            udp_queue_limit: 1024,
            tcp_backlog: 128,
            capture: CaptureConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            snaplen: 65535,
            link_type: LINKTYPE_ETHERNET,
        }
    }
}

impl StackConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: StackConfig =
            serde_json::from_str(text).map_err(|e| NetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl == 0 {
            return Err(NetError::Config("default_ttl must be at least 1".into()));
        }
        if self.ephemeral_port_start == 0 || self.ephemeral_port_start > self.ephemeral_port_end {
            return Err(NetError::Config(format!(
                "bad ephemeral range {}-{}",
                self.ephemeral_port_start, self.ephemeral_port_end
            )));
        }
        if self.capture.snaplen == 0 {
            return Err(NetError::Config("capture snaplen must be non-zero".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
