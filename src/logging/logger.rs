// Logger handles and the shared ring they write into

use super::entry::LogEntry;
use super::{Facility, Severity};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Bounded MPSC ring shared by every datapath thread. Producers never block:
/// when the ring is full the entry is dropped and counted.
pub(super) struct LogRing {
    queue: ArrayQueue<LogEntry>,
    dropped: AtomicU64,
}

impl LogRing {
    fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    pub(super) fn push(&self, entry: LogEntry) {
        if self.queue.push(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(super) fn pop(&self) -> Option<LogEntry> {
        self.queue.pop()
    }

    pub(super) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Logger handle for writing log entries
///
/// This is a lightweight handle that can be cloned and passed around.
/// The actual ring is shared via Arc.
#[derive(Clone)]
pub struct Logger {
    ring: Arc<LogRing>,
    min_severity: Arc<AtomicU8>,
}

impl Logger {
    /// Write a log entry
    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if severity.as_u8() > self.min_severity.load(Ordering::Relaxed) {
            return;
        }
        self.ring.push(LogEntry::new(severity, facility, message));
    }

    /// Log with critical severity
    #[inline]
    pub fn critical(&self, facility: Facility, message: &str) {
        self.log(Severity::Critical, facility, message);
    }

    /// Log with error severity
    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    /// Log with warning severity
    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    /// Log with notice severity
    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    /// Log with info severity
    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    /// Log with debug severity
    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}

/// Owns the shared ring and hands out Logger handles.
pub struct LogRegistry {
    ring: Arc<LogRing>,
    min_severity: Arc<AtomicU8>,
}

impl LogRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(LogRing::new(capacity)),
            min_severity: Arc::new(AtomicU8::new(Severity::Debug.as_u8())),
        }
    }

    pub fn logger(&self) -> Logger {
        Logger {
            ring: Arc::clone(&self.ring),
            min_severity: Arc::clone(&self.min_severity),
        }
    }

    /// Set the minimum severity accepted by every handle from this registry.
    pub fn set_min_severity(&self, severity: Severity) {
        self.min_severity.store(severity.as_u8(), Ordering::Relaxed);
    }

    pub(super) fn ring(&self) -> Arc<LogRing> {
        Arc::clone(&self.ring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_basic() {
        let registry = LogRegistry::new(16);
        let logger = registry.logger();

        logger.info(Facility::Test, "Test message");
        logger.error(Facility::Test, "Error message");

        let ring = registry.ring();
        assert_eq!(ring.pop().unwrap().message, "Test message");
        assert_eq!(ring.pop().unwrap().message, "Error message");
        assert!(ring.pop().is_none());
    }

    #[test]
    fn overflow_drops_and_counts() {
        let registry = LogRegistry::new(2);
        let logger = registry.logger();
        for i in 0..5 {
            logger.info(Facility::Test, &format!("entry {i}"));
        }
        let ring = registry.ring();
        assert_eq!(ring.dropped(), 3);
        assert_eq!(ring.pop().unwrap().message, "entry 0");
        assert_eq!(ring.pop().unwrap().message, "entry 1");
    }

    #[test]
    fn min_severity_filters() {
        let registry = LogRegistry::new(16);
        registry.set_min_severity(Severity::Warning);
        let logger = registry.logger();

        logger.debug(Facility::Test, "filtered");
        logger.info(Facility::Test, "also filtered");
        logger.warning(Facility::Test, "kept");
        logger.critical(Facility::Test, "kept too");

        let ring = registry.ring();
        assert_eq!(ring.pop().unwrap().message, "kept");
        assert_eq!(ring.pop().unwrap().message, "kept too");
        assert!(ring.pop().is_none());
    }

    #[test]
    fn logger_clone_shares_ring() {
        let registry = LogRegistry::new(16);
        let logger1 = registry.logger();
        let logger2 = logger1.clone();

        logger1.info(Facility::Test, "From logger1");
        logger2.info(Facility::Test, "From logger2");

        let ring = registry.ring();
        assert!(ring.pop().is_some());
        assert!(ring.pop().is_some());
    }
}
