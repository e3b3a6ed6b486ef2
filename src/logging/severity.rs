// Severity levels for logging (RFC 5424 syslog-style)

use serde::{Deserialize, Serialize};

/// Log severity levels (0-7, lower is more severe)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Critical conditions (forwarder thread lost, fd leak)
    Critical = 2,
    /// Error conditions (read failure, short write, platform refusal)
    Error = 3,
    /// Warning conditions (forwarder fault, stale notification)
    Warning = 4,
    /// Significant normal condition (network switch, rekey)
    Notice = 5,
    /// Informational (forwarder start/stop, keepalive config)
    Info = 6,
    /// Debug-level messages (per-event traces)
    Debug = 7,
}

impl Severity {
    /// Get severity level as u8
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Get severity name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    /// Create from u8 value (returns None if invalid)
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(Severity::Critical),
            3 => Some(Severity::Error),
            4 => Some(Severity::Warning),
            5 => Some(Severity::Notice),
            6 => Some(Severity::Info),
            7 => Some(Severity::Debug),
            _ => None,
        }
    }
}
