// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet forwarder: the two pump loops between tunnel and network socket.
//!
//! Lifecycle is a single atomic: Running → Connected (after the first
//! successful uplink write and the first successful downlink read) →
//! Terminated. At most one terminal notification leaves a forwarder, and a
//! connected notification can never be posted after it. `stop` terminates
//! silently: it flips the state first, so neither pump can post afterwards.

use crate::datapath::{SocketInterface, TunnelInterface};
use crate::logging::{Facility, Logger};
use crate::notification::SerialExecutor;
use crate::status::{DatapathError, Result};
use crate::DatapathDebugInfo;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

const STATE_RUNNING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_TERMINATED: u8 = 2;

/// Sink for forwarder lifecycle events, delivered on the serial executor.
/// The generation identifies which forwarder instance an event belongs to,
/// so a listener can discard events from a forwarder it already replaced.
pub trait ForwarderNotification: Send + Sync {
    fn forwarder_connected(&self, generation: u64);
    fn forwarder_failed(&self, generation: u64, status: DatapathError);
    fn forwarder_permanent_failure(&self, generation: u64, status: DatapathError);
}

#[derive(Default)]
struct ForwarderCounters {
    uplink_packets_read: AtomicU64,
    uplink_packets_written: AtomicU64,
    downlink_packets_read: AtomicU64,
    downlink_packets_written: AtomicU64,
}

struct PumpShared {
    tunnel: Arc<dyn TunnelInterface>,
    socket: Arc<dyn SocketInterface>,
    executor: Arc<SerialExecutor>,
    notification: Weak<dyn ForwarderNotification>,
    generation: u64,
    state: AtomicU8,
    uplink_traffic_seen: AtomicBool,
    downlink_traffic_seen: AtomicBool,
    counters: ForwarderCounters,
    logger: Logger,
}

impl PumpShared {
    fn run_uplink(&self) {
        self.logger.info(Facility::Forwarder, "uplink pump started");
        loop {
            if self.state.load(Ordering::SeqCst) == STATE_TERMINATED {
                break;
            }
            let packets = match self.tunnel.read_packets() {
                Ok(packets) => packets,
                Err(status) => {
                    self.post_terminal(status, false);
                    break;
                }
            };
            if packets.is_empty() {
                self.logger.info(
                    Facility::Forwarder,
                    "tunnel reported graceful close; uplink pump exiting",
                );
                break;
            }
            // Keepalive markers ride the same path; the egress node
            // recognizes them on the wire.
            let count = packets.len() as u64;
            self.counters
                .uplink_packets_read
                .fetch_add(count, Ordering::Relaxed);
            if let Err(status) = self.socket.write_packets(packets) {
                self.post_terminal(status, false);
                break;
            }
            self.counters
                .uplink_packets_written
                .fetch_add(count, Ordering::Relaxed);
            if !self.uplink_traffic_seen.swap(true, Ordering::SeqCst) {
                self.maybe_connected();
            }
        }
        self.logger.info(Facility::Forwarder, "uplink pump exited");
    }

    fn run_downlink(&self) {
        self.logger.info(Facility::Forwarder, "downlink pump started");
        loop {
            if self.state.load(Ordering::SeqCst) == STATE_TERMINATED {
                break;
            }
            let packets = match self.socket.read_packets() {
                Ok(packets) => packets,
                Err(status) => {
                    self.post_terminal(status, true);
                    break;
                }
            };
            if packets.is_empty() {
                self.logger.info(
                    Facility::Forwarder,
                    "network socket reported graceful close; downlink pump exiting",
                );
                break;
            }
            let count = packets.len() as u64;
            self.counters
                .downlink_packets_read
                .fetch_add(count, Ordering::Relaxed);
            if !self.downlink_traffic_seen.swap(true, Ordering::SeqCst) {
                self.maybe_connected();
            }
            if let Err(status) = self.tunnel.write_packets(packets) {
                self.post_terminal(status, false);
                break;
            }
            self.counters
                .downlink_packets_written
                .fetch_add(count, Ordering::Relaxed);
        }
        self.logger.info(Facility::Forwarder, "downlink pump exited");
    }

    fn maybe_connected(&self) {
        if !(self.uplink_traffic_seen.load(Ordering::SeqCst)
            && self.downlink_traffic_seen.load(Ordering::SeqCst))
        {
            return;
        }
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_CONNECTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.logger.notice(
                Facility::Forwarder,
                "bidirectional traffic observed; forwarder connected",
            );
            let notification = self.notification.clone();
            let generation = self.generation;
            self.executor.post(move || {
                if let Some(notification) = notification.upgrade() {
                    notification.forwarder_connected(generation);
                }
            });
        }
    }

    /// Emit at most one terminal event per forwarder. `from_network_read`
    /// gates the permanent classification: only a network socket read can
    /// report that the underlying network was revoked.
    fn post_terminal(&self, status: DatapathError, from_network_read: bool) {
        let previous = self.state.swap(STATE_TERMINATED, Ordering::SeqCst);
        if previous == STATE_TERMINATED {
            return;
        }
        let permanent = from_network_read && status.is_permanent_network_failure();
        self.logger.warning(
            Facility::Forwarder,
            &format!(
                "forwarder {} failure: {status}",
                if permanent { "permanent" } else { "transient" }
            ),
        );
        let notification = self.notification.clone();
        let generation = self.generation;
        self.executor.post(move || {
            if let Some(notification) = notification.upgrade() {
                if permanent {
                    notification.forwarder_permanent_failure(generation, status);
                } else {
                    notification.forwarder_failed(generation, status);
                }
            }
        });
    }
}

pub struct IpSecPacketForwarder {
    shared: Arc<PumpShared>,
    uplink: Option<JoinHandle<()>>,
    downlink: Option<JoinHandle<()>>,
}

impl IpSecPacketForwarder {
    pub fn new(
        tunnel: Arc<dyn TunnelInterface>,
        socket: Arc<dyn SocketInterface>,
        executor: Arc<SerialExecutor>,
        notification: Weak<dyn ForwarderNotification>,
        generation: u64,
        logger: Logger,
    ) -> Self {
        Self {
            shared: Arc::new(PumpShared {
                tunnel,
                socket,
                executor,
                notification,
                generation,
                state: AtomicU8::new(STATE_RUNNING),
                uplink_traffic_seen: AtomicBool::new(false),
                downlink_traffic_seen: AtomicBool::new(false),
                counters: ForwarderCounters::default(),
                logger,
            }),
            uplink: None,
            downlink: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Spawn both pump threads.
    pub fn start(&mut self) -> Result<()> {
        debug_assert!(self.uplink.is_none() && self.downlink.is_none());
        let shared = Arc::clone(&self.shared);
        self.uplink = Some(
            std::thread::Builder::new()
                .name("uplink".to_string())
                .spawn(move || shared.run_uplink())
                .map_err(|e| {
                    DatapathError::internal(format!("failed to spawn uplink pump: {e}"))
                })?,
        );
        let shared = Arc::clone(&self.shared);
        self.downlink = Some(
            std::thread::Builder::new()
                .name("downlink".to_string())
                .spawn(move || shared.run_downlink())
                .map_err(|e| {
                    DatapathError::internal(format!("failed to spawn downlink pump: {e}"))
                })?,
        );
        Ok(())
    }

    /// Cancel pending reads on both endpoints and join both pumps. No
    /// notification is emitted on this path.
    pub fn stop(&mut self) {
        let previous = self.shared.state.swap(STATE_TERMINATED, Ordering::SeqCst);
        if previous != STATE_TERMINATED {
            self.shared
                .logger
                .info(Facility::Forwarder, "stopping packet forwarder");
        }
        if let Err(e) = self.shared.tunnel.cancel_read_packets() {
            self.shared
                .logger
                .error(Facility::Forwarder, &format!("cancelling tunnel read: {e}"));
        }
        if let Err(e) = self.shared.socket.cancel_read_packets() {
            self.shared
                .logger
                .error(Facility::Forwarder, &format!("cancelling socket read: {e}"));
        }
        if let Some(handle) = self.uplink.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.downlink.take() {
            let _ = handle.join();
        }
        // The tunnel outlives this forwarder; re-arm its reads so the next
        // forwarder does not observe a stale cancellation.
        self.shared.tunnel.clear_read_cancellation();
    }

    pub fn fill_debug_info(&self, info: &mut DatapathDebugInfo) {
        let counters = &self.shared.counters;
        info.uplink_packets_read = counters.uplink_packets_read.load(Ordering::Relaxed);
        info.uplink_packets_written = counters.uplink_packets_written.load(Ordering::Relaxed);
        info.downlink_packets_read = counters.downlink_packets_read.load(Ordering::Relaxed);
        info.downlink_packets_written = counters.downlink_packets_written.load(Ordering::Relaxed);
    }
}

impl Drop for IpSecPacketForwarder {
    fn drop(&mut self) {
        if self.uplink.is_some() || self.downlink.is_some() {
            self.stop();
        }
    }
}
