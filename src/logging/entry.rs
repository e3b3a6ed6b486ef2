// SPDX-License-Identifier: Apache-2.0 OR MIT
// Log entry carried through the ring

use super::{Facility, Severity};
use chrono::{DateTime, Local};

/// A single formatted-on-consume log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub facility: Facility,
    pub thread: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(severity: Severity, facility: Facility, message: &str) -> Self {
        Self {
            timestamp: Local::now(),
            severity,
            facility,
            thread: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string(),
            message: message.to_string(),
        }
    }

    /// Render one line: [TIMESTAMP] [SEVERITY] [Facility] (thread) message
    pub fn format_line(&self) -> String {
        format!(
            "[{}] [{}] [{}] ({}) {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.severity.as_str(),
            self.facility.as_str(),
            self.thread,
            self.message
        )
    }
}
