// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Serial executor delivering datapath events to the session controller.
//!
//! The datapath never invokes controller callbacks synchronously. Everything
//! is posted here and runs on one named thread in FIFO order, so the
//! controller observes events in program order and can call back into the
//! datapath without re-entering a lock.

use crate::logging::{Facility, Logger};
use crate::status::{DatapathError, Result};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct SerialExecutor {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl SerialExecutor {
    /// Spawn the executor thread. `name` becomes the OS thread name.
    pub fn new(name: &str, logger: Logger) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .map_err(|e| {
                DatapathError::internal(format!("failed to spawn executor thread {name:?}: {e}"))
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            logger,
        })
    }

    /// Enqueue a task. Never blocks. Tasks posted after shutdown are dropped
    /// with a log line rather than delivered out of band.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Box::new(task)).is_err() {
                    self.logger
                        .warning(Facility::Notification, "executor thread is gone; task dropped");
                }
            }
            None => {
                self.logger
                    .debug(Facility::Notification, "task posted after shutdown; dropped");
            }
        }
    }

    /// Stop accepting tasks, run out the queue, and join the thread.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
