// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for the datapath.
//!
//! JSON5 configuration format supporting comments and trailing commas.
//! Everything has a default so an empty document is a valid config.

use crate::IpProtocol;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Datapath tuning knobs. All fields optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatapathConfig {
    /// NAT keepalive interval when the egress endpoint is IPv4. Zero disables.
    #[serde(default = "default_ipv4_keepalive_secs")]
    pub ipv4_keepalive_interval_secs: u64,

    /// NAT keepalive interval when the egress endpoint is IPv6. Zero disables.
    /// NAT timeouts are a v4 problem; over v6 a long interval only keeps
    /// stateful middleboxes from expiring the flow.
    #[serde(default = "default_ipv6_keepalive_secs")]
    pub ipv6_keepalive_interval_secs: u64,

    /// Path MTU assumed at session start, before any PMTU feedback arrives.
    #[serde(default = "default_initial_path_mtu")]
    pub initial_path_mtu: u32,

    /// Capacity of the lock-free log ring shared by all datapath threads.
    #[serde(default = "default_log_ring_capacity")]
    pub log_ring_capacity: usize,
}

fn default_ipv4_keepalive_secs() -> u64 {
    20
}

fn default_ipv6_keepalive_secs() -> u64 {
    3600
}

fn default_initial_path_mtu() -> u32 {
    1500
}

fn default_log_ring_capacity() -> usize {
    1024
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            ipv4_keepalive_interval_secs: default_ipv4_keepalive_secs(),
            ipv6_keepalive_interval_secs: default_ipv6_keepalive_secs(),
            initial_path_mtu: default_initial_path_mtu(),
            log_ring_capacity: default_log_ring_capacity(),
        }
    }
}

impl DatapathConfig {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to a JSON5-compatible string.
    /// The json5 crate has no pretty printer, so output goes through
    /// serde_json; json5 handles comments and trailing commas on input.
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The tunnel MTU must stay positive after IPsec overhead for either
        // family; the v6 overhead is the larger of the two.
        let min_mtu = crate::datapath::mtu::IPV6_TUNNEL_OVERHEAD + 1;
        if self.initial_path_mtu < min_mtu {
            return Err(ConfigError::InvalidMtu {
                mtu: self.initial_path_mtu,
                minimum: min_mtu,
            });
        }
        if self.log_ring_capacity == 0 {
            return Err(ConfigError::EmptyLogRing);
        }
        Ok(())
    }

    /// Keepalive interval for the given destination family; `None` disables.
    pub fn keepalive_interval(&self, ip_protocol: IpProtocol) -> Option<Duration> {
        let secs = match ip_protocol {
            IpProtocol::V4 => self.ipv4_keepalive_interval_secs,
            IpProtocol::V6 => self.ipv6_keepalive_interval_secs,
            IpProtocol::Unknown => return None,
        };
        if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    IoError(std::path::PathBuf, String),
    ParseError(String),
    InvalidMtu { mtu: u32, minimum: u32 },
    EmptyLogRing,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, msg) => {
                write!(
                    f,
                    "failed to read config file '{}': {}",
                    path.display(),
                    msg
                )
            }
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::InvalidMtu { mtu, minimum } => write!(
                f,
                "initial_path_mtu {} is below the minimum {} (IPv6 IPsec overhead + 1)",
                mtu, minimum
            ),
            ConfigError::EmptyLogRing => write!(f, "log_ring_capacity must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
