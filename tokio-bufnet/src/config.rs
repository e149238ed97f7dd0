//! Bandwidth configuration shared by [`ThrottledListener`](crate::listener::ThrottledListener)
//! and its connections.
//!
//! Both knobs are **bytes per second**:
//! - `0` means unlimited,
//! - a negative value is silently replaced with [`DEFAULT_BANDWIDTH`].
//!
//! The type deserializes with `serde`, so it can live inside a larger service config:
//! ```
//! use tokio_bufnet::config::ThrottleConfig;
//!
//! let cfg: ThrottleConfig =
//!     serde_json::from_str(r#"{ "server_bandwidth": 4096, "conn_bandwidth": 1024 }"#).unwrap();
//! assert!(cfg.validate().is_ok());
//! ```
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Bandwidth substituted for negative settings.
pub const DEFAULT_BANDWIDTH: i64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum ConfigError {
    #[error(
        "connection bandwidth ({conn} B/s) should not exceed server bandwidth ({server} B/s)"
    )]
    ConnBandwidthExceedsServer { server: i64, conn: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Aggregate cap shared by every open connection.
    pub server_bandwidth: i64,
    /// Cap of a single connection when it is alone.
    pub conn_bandwidth: i64,
}

impl ThrottleConfig {
    pub fn new(server_bandwidth: i64, conn_bandwidth: i64) -> Self {
        Self {
            server_bandwidth,
            conn_bandwidth,
        }
    }

    /// Replace negative values with [`DEFAULT_BANDWIDTH`].
    pub fn normalized(self) -> Self {
        Self {
            server_bandwidth: normalize(self.server_bandwidth),
            conn_bandwidth: normalize(self.conn_bandwidth),
        }
    }

    /// Reject a per-connection cap that alone exceeds the aggregate cap.
    ///
    /// Checked on the normalized values. An unlimited server accepts any connection cap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Self {
            server_bandwidth: server,
            conn_bandwidth: conn,
        } = self.normalized();

        if server > 0 && conn > server {
            return Err(ConfigError::ConnBandwidthExceedsServer { server, conn });
        }

        Ok(())
    }
}

#[inline]
pub(crate) fn normalize(bandwidth: i64) -> i64 {
    if bandwidth < 0 {
        DEFAULT_BANDWIDTH
    } else {
        bandwidth
    }
}
