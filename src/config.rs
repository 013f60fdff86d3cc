//! Transport configuration.

use crate::error::{RaftNetError, Result};
use crate::types::{ProtocolVersion, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use std::time::Duration;

/// Default number of bytes (or entries) covered by one base timeout unit
/// when scaling deadlines for body-size-proportional RPCs.
pub const DEFAULT_TIMEOUT_SCALE: usize = 256 * 1024; // 256 KiB

/// Default pipeline depth when `max_rpcs_in_flight` is left at 0.
pub const DEFAULT_MAX_RPCS_IN_FLIGHT: usize = 2;

/// Smallest `max_rpcs_in_flight` value that still permits pipelining.
pub const MIN_IN_FLIGHT_FOR_PIPELINING: usize = 2;

/// Configuration for a [`NetworkTransport`](crate::transport::NetworkTransport).
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Idle outbound connections cached per peer. Must be at least 1.
    pub max_pool: usize,
    /// Pipeline depth for AppendEntries replication. 0 selects
    /// [`DEFAULT_MAX_RPCS_IN_FLIGHT`]; 1 disables pipelining.
    pub max_rpcs_in_flight: usize,
    /// Base deadline applied to each RPC exchange. Zero disables deadlines.
    pub timeout: Duration,
    /// Bytes (entries for AppendEntries) per base timeout unit when scaling
    /// deadlines for large payloads.
    pub timeout_scale: usize,
    /// Protocol version stamped into outbound RPC headers.
    pub protocol_version: ProtocolVersion,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_pool: 3,
            max_rpcs_in_flight: DEFAULT_MAX_RPCS_IN_FLIGHT,
            timeout: Duration::from_secs(10),
            timeout_scale: DEFAULT_TIMEOUT_SCALE,
            protocol_version: PROTOCOL_VERSION_MAX,
        }
    }
}

impl NetworkConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool < 1 {
            return Err(RaftNetError::InvalidConfig {
                field: "max_pool".to_string(),
                reason: "must cache at least one connection per peer".to_string(),
            });
        }

        if self.timeout_scale == 0 {
            return Err(RaftNetError::InvalidConfig {
                field: "timeout_scale".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        if self.protocol_version < PROTOCOL_VERSION_MIN
            || self.protocol_version > PROTOCOL_VERSION_MAX
        {
            return Err(RaftNetError::InvalidConfig {
                field: "protocol_version".to_string(),
                reason: format!(
                    "must be between {} and {}",
                    PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX
                ),
            });
        }

        Ok(())
    }

    /// The pipeline depth after applying the 0-means-default rule.
    pub fn effective_max_rpcs_in_flight(&self) -> usize {
        if self.max_rpcs_in_flight == 0 {
            DEFAULT_MAX_RPCS_IN_FLIGHT
        } else {
            self.max_rpcs_in_flight
        }
    }
}
