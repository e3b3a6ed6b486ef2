// Log consumer thread - drains the ring and writes formatted lines to a sink

use super::entry::LogEntry;
use super::logger::LogRing;
use super::LogRegistry;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Output sink for log entries
pub trait LogSink: Send {
    /// Write one formatted line to the sink
    fn write_line(&mut self, line: &str);

    /// Flush any buffered output
    fn flush(&mut self) {}
}

/// Standard error sink
pub struct StderrSink {
    stderr: std::io::Stderr,
}

impl StderrSink {
    pub fn new() -> Self {
        Self {
            stderr: std::io::stderr(),
        }
    }
}

impl Default for StderrSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for StderrSink {
    fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.stderr, "{line}");
    }

    fn flush(&mut self) {
        let _ = self.stderr.flush();
    }
}

/// In-memory sink for tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn write_line(&mut self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Drains the registry's ring on a dedicated thread until stopped. The final
/// drain on shutdown also reports how many entries overflowed the ring.
pub struct LogConsumer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogConsumer {
    pub fn spawn(registry: &LogRegistry, mut sink: Box<dyn LogSink>) -> std::io::Result<Self> {
        let ring = registry.ring();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("log-consumer".to_string())
            .spawn(move || {
                loop {
                    Self::drain(&ring, sink.as_mut());
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                // Entries raced in between the last drain and the stop flag.
                Self::drain(&ring, sink.as_mut());
                let dropped = ring.dropped();
                if dropped > 0 {
                    sink.write_line(&format!("log ring overflowed; {dropped} entries dropped"));
                }
                sink.flush();
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn drain(ring: &LogRing, sink: &mut dyn LogSink) {
        let mut wrote = false;
        while let Some(entry) = ring.pop() {
            sink.write_line(&LogEntry::format_line(&entry));
            wrote = true;
        }
        if wrote {
            sink.flush();
        }
    }

    /// Stop the consumer and wait for its final drain.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
