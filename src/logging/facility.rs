// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Logging facility - identifies which component generated the log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Datapath coordinator, network switches, key handling
    Datapath = 0,
    /// TUN endpoint reads/writes, keepalive timer
    Tunnel = 1,
    /// UDP endpoint toward the egress node
    NetworkSocket = 2,
    /// Uplink/downlink pump loops
    Forwarder = 3,
    /// Serial executor delivering controller events
    Notification = 4,
    /// Configuration load and validation
    Config = 5,
    /// Test harness and fixtures
    Test = 6,

    /// Fallback for uncategorized messages
    Unknown = 255,
}

impl Facility {
    /// Get facility code as u8
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Get facility name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Datapath => "Datapath",
            Facility::Tunnel => "Tunnel",
            Facility::NetworkSocket => "NetworkSocket",
            Facility::Forwarder => "Forwarder",
            Facility::Notification => "Notification",
            Facility::Config => "Config",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    /// Create from u8 value (returns Unknown if invalid)
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::Datapath,
            1 => Facility::Tunnel,
            2 => Facility::NetworkSocket,
            3 => Facility::Forwarder,
            4 => Facility::Notification,
            5 => Facility::Config,
            6 => Facility::Test,
            _ => Facility::Unknown,
        }
    }
}
