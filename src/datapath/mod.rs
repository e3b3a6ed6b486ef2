// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The IPsec datapath subsystem.
//!
//! [`IpSecDatapath`] coordinates one retained tunnel, one network socket and
//! one packet forwarder per active network, and pushes key material into the
//! platform's kernel bindings. All mutable state sits behind a single mutex,
//! held only for in-memory mutations: it is released before platform calls,
//! before joining pump threads, and controller callbacks are posted to the
//! serial executor instead of invoked inline.

pub mod events;
pub mod forwarder;
pub mod key_material;
pub mod mtu;
pub mod socket;
pub mod tunnel;

use crate::config::DatapathConfig;
use crate::logging::{Facility, Logger};
use crate::notification::SerialExecutor;
use crate::packet::Packet;
use crate::status::{DatapathError, Result};
use crate::{DatapathDebugInfo, EgressInfo, Endpoint, IpProtocol, NetworkInfo, TunFdData};
use forwarder::{ForwarderNotification, IpSecPacketForwarder};
use key_material::{IpSecTransformParams, TransformParams};
use mtu::MtuTracker;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub use socket::DatagramSocket;
pub use tunnel::IpSecTunnel;

/// Blocking, cancellable packet I/O shared by both endpoint kinds.
pub trait PacketPipe: Send + Sync {
    /// Block until packets, cancellation, or an endpoint-specific deadline.
    /// An empty vector with Ok is the graceful-closed signal.
    fn read_packets(&self) -> Result<Vec<Packet>>;

    /// Write every packet in order; a short write fails the call.
    fn write_packets(&self, packets: Vec<Packet>) -> Result<()>;
}

/// The TUN side. Long-lived: owned by the platform binding and borrowed by
/// the datapath for its whole life, surviving network switches.
pub trait TunnelInterface: PacketPipe {
    /// A `None` or zero interval disables the keepalive timer.
    fn set_keepalive_interval(&self, interval: Option<Duration>);
    fn keepalive_interval(&self) -> Option<Duration>;
    fn is_keepalive_enabled(&self) -> bool;

    /// Wake a pending read; it returns empty with Ok. Stays in effect until
    /// [`TunnelInterface::clear_read_cancellation`].
    fn cancel_read_packets(&self) -> Result<()>;

    /// Re-arm reads after a cancellation. Call only once no reader is in
    /// flight. Has no effect on a closed tunnel.
    fn clear_read_cancellation(&self);

    /// Idempotent; wakes any in-flight reader exactly once.
    fn close(&self) -> Result<()>;
}

/// The UDP side. Exclusively owned by the current forwarder/datapath and
/// replaced on every network switch.
pub trait SocketInterface: PacketPipe {
    /// Pin the destination; required before any write.
    fn connect(&self, dest: &Endpoint) -> Result<()>;
    fn fd(&self) -> RawFd;
    fn cancel_read_packets(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn debug_string(&self) -> String;
}

/// Platform binding ("VPN service"): allocates protected resources and
/// installs kernel IPsec transforms. Implemented per host platform.
pub trait VpnService: Send + Sync {
    /// Ask the host to allocate a TUN device with the supplied
    /// addresses/DNS/routes.
    fn create_tunnel(&self, tun_fd_data: &TunFdData) -> Result<()>;

    /// The retained tunnel endpoint. Must stay alive for the life of the
    /// datapath.
    fn get_tunnel(&self) -> Result<Arc<dyn TunnelInterface>>;

    /// A UDP socket bound to the given host network, exempt from VPN
    /// routing, already connected to `endpoint`.
    fn create_protected_network_socket(
        &self,
        network_info: &NetworkInfo,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn SocketInterface>>;

    /// Install ESP transforms for the SPIs/keys/socket in `params`.
    fn configure_ipsec(&self, params: &IpSecTransformParams) -> Result<()>;
}

/// Events the session controller receives, always on the notification
/// executor, never from inside a datapath call.
pub trait DatapathNotification: Send + Sync {
    fn datapath_established(&self);
    fn datapath_failed(&self, status: DatapathError);
    fn datapath_permanent_failure(&self, status: DatapathError);
    /// Reserved for session-timer integration; never produced here.
    fn do_rekey(&self) {}
}

struct DatapathInner {
    key_material: Option<IpSecTransformParams>,
    network_socket: Option<Arc<dyn SocketInterface>>,
    forwarder: Option<IpSecPacketForwarder>,
    mtu: MtuTracker,
}

pub struct IpSecDatapath {
    config: DatapathConfig,
    vpn_service: Arc<dyn VpnService>,
    executor: Arc<SerialExecutor>,
    logger: Logger,
    notification: Mutex<Option<Arc<dyn DatapathNotification>>>,
    /// Handle to our own allocation, handed to forwarders as their event
    /// sink. Weak: a forwarder must not keep a dead datapath alive.
    self_weak: Weak<IpSecDatapath>,
    /// Generation of the most recently started forwarder; events tagged with
    /// an older generation are stale and ignored.
    forwarder_generation: AtomicU64,
    inner: Mutex<DatapathInner>,
}

impl IpSecDatapath {
    pub fn new(
        config: DatapathConfig,
        vpn_service: Arc<dyn VpnService>,
        executor: Arc<SerialExecutor>,
        logger: Logger,
    ) -> Arc<Self> {
        let mtu = MtuTracker::new(config.initial_path_mtu);
        Arc::new_cyclic(|self_weak| Self {
            config,
            vpn_service,
            executor,
            logger,
            notification: Mutex::new(None),
            self_weak: self_weak.clone(),
            forwarder_generation: AtomicU64::new(0),
            inner: Mutex::new(DatapathInner {
                key_material: None,
                network_socket: None,
                forwarder: None,
                mtu,
            }),
        })
    }

    /// Register for datapath state changes. Must happen before [`Self::start`].
    pub fn register_notification_handler(&self, handler: Arc<dyn DatapathNotification>) {
        *self.notification.lock().unwrap() = Some(handler);
    }

    /// Seed key material for the session. Does not start forwarding; that
    /// happens on the first [`Self::switch_network`].
    pub fn start(&self, _egress: &EgressInfo, params: &TransformParams) -> Result<()> {
        debug_assert!(
            self.notification.lock().unwrap().is_some(),
            "notification handler must be registered before start"
        );
        let Some(ipsec) = params.ipsec() else {
            return Err(DatapathError::invalid_argument(
                "IPsec datapath missing transform params",
            ));
        };
        let mut inner = self.inner.lock().unwrap();
        inner.key_material = Some(ipsec.clone());
        self.logger.info(
            Facility::Datapath,
            &format!(
                "start IPsec with uplink_spi={} downlink_spi={}",
                ipsec.uplink_spi, ipsec.downlink_spi
            ),
        );
        Ok(())
    }

    /// Move the datapath onto a new host network: tear down the previous
    /// forwarder and socket, provision a protected socket, install the
    /// transforms and start a fresh forwarder over the retained tunnel.
    ///
    /// A platform failure to provision or connect the socket does not fail
    /// the call: it is reported as `DatapathFailed` and the controller owns
    /// the retry. A `configure_ipsec` failure is returned synchronously.
    pub fn switch_network(
        &self,
        session_id: u32,
        endpoint: &Endpoint,
        network_info: Option<&NetworkInfo>,
    ) -> Result<()> {
        let Some(network_info) = network_info else {
            self.logger.error(Facility::Datapath, "network_info is unset");
            return Err(DatapathError::invalid_argument("network_info is unset"));
        };
        let tunnel = self.vpn_service.get_tunnel()?;
        self.logger.notice(
            Facility::Datapath,
            &format!("switching network to id={}", network_info.network_id),
        );

        self.shutdown_packet_forwarder();

        // Stamp the session id under a short lock before any platform call.
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(key_material) = inner.key_material.as_mut() else {
                return Err(DatapathError::failed_precondition("key material is not set"));
            };
            key_material.uplink_spi = session_id;
        }

        let socket = match self
            .vpn_service
            .create_protected_network_socket(network_info, endpoint)
        {
            Ok(socket) => socket,
            Err(status) => {
                self.logger.error(
                    Facility::Datapath,
                    &format!("unable to configure network socket: {status}"),
                );
                self.post_notification(move |n| n.datapath_failed(status));
                // The preceding notification owns this failure; the call
                // itself succeeds so the controller can schedule a retry.
                return Ok(());
            }
        };

        let keepalive = match endpoint.ip_protocol() {
            IpProtocol::V4 | IpProtocol::V6 => {
                self.config.keepalive_interval(endpoint.ip_protocol())
            }
            IpProtocol::Unknown => {
                return Err(DatapathError::internal(
                    "unsupported address family for endpoint",
                ));
            }
        };
        tunnel.set_keepalive_interval(keepalive);

        // In-memory mutations only, then drop the lock again: the kernel
        // transform installation below can block.
        let params = {
            let mut inner = self.inner.lock().unwrap();
            inner.mtu.update_dest_ip_protocol(endpoint.ip_protocol());
            let Some(key_material) = inner.key_material.as_mut() else {
                return Err(DatapathError::failed_precondition("key material is not set"));
            };
            key_material.network_id = network_info.network_id;
            key_material.network_fd = socket.fd();
            key_material.destination = Some(endpoint.clone());
            key_material.destination_address_family = endpoint.ip_protocol();
            key_material.keepalive_interval_secs =
                keepalive.map(|interval| interval.as_secs() as u32).unwrap_or(0);
            key_material.clone()
        };

        self.logger.info(
            Facility::Datapath,
            &format!(
                "configuring IPsec with fd={} network={} uplink_spi={} downlink_spi={} endpoint={}",
                params.network_fd, params.network_id, params.uplink_spi, params.downlink_spi,
                endpoint
            ),
        );
        self.vpn_service.configure_ipsec(&params)?;

        // Publishing socket and forwarder happens under the lock so a
        // concurrent Stop either sees neither or tears down both. Spawning
        // the pumps is thread creation, not I/O.
        let generation = self.forwarder_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let notification: Weak<dyn ForwarderNotification> = self.self_weak.clone();
        let mut forwarder = IpSecPacketForwarder::new(
            tunnel,
            Arc::clone(&socket),
            Arc::clone(&self.executor),
            notification,
            generation,
            self.logger.clone(),
        );
        let mut inner = self.inner.lock().unwrap();
        inner.network_socket = Some(socket);
        self.logger
            .info(Facility::Datapath, "starting packet forwarder");
        forwarder.start()?;
        inner.forwarder = Some(forwarder);

        Ok(())
    }

    /// Swap keys in place for a rekey. Sockets and forwarder are untouched.
    pub fn set_key_materials(&self, params: &TransformParams) -> Result<()> {
        let Some(ipsec) = params.ipsec() else {
            self.logger.error(
                Facility::Datapath,
                "received key material that is not of type IPsec",
            );
            return Err(DatapathError::invalid_argument(
                "received key material that is not of type IPsec",
            ));
        };
        let mut inner = self.inner.lock().unwrap();
        inner.key_material = Some(ipsec.clone());
        self.logger.info(
            Facility::Datapath,
            &format!(
                "set key material with uplink_spi={} downlink_spi={}",
                ipsec.uplink_spi, ipsec.downlink_spi
            ),
        );
        Ok(())
    }

    /// Tear down the forwarder and network socket. The tunnel is left alone;
    /// it belongs to the platform binding.
    pub fn stop(&self) {
        self.shutdown_packet_forwarder();
    }

    /// Fold a new path-MTU observation into the tracker. MTU only shrinks
    /// within a session.
    pub fn update_path_mtu(&self, path_mtu: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.mtu.update_mtu(path_mtu);
        self.logger.info(
            Facility::Datapath,
            &format!(
                "path mtu now {}, tunnel mtu {}",
                inner.mtu.path_mtu(),
                inner.mtu.tunnel_mtu()
            ),
        );
    }

    /// Snapshot counters, SPIs and MTU state.
    pub fn get_debug_info(&self) -> DatapathDebugInfo {
        let inner = self.inner.lock().unwrap();
        let mut info = DatapathDebugInfo::default();
        if let Some(key_material) = &inner.key_material {
            info.uplink_spi = key_material.uplink_spi;
            info.downlink_spi = key_material.downlink_spi;
            info.network_id = key_material.network_id;
            info.network_fd = key_material.network_fd;
        } else {
            info.network_fd = -1;
        }
        info.path_mtu = inner.mtu.path_mtu();
        info.tunnel_mtu = inner.mtu.tunnel_mtu();
        if let Some(forwarder) = &inner.forwarder {
            forwarder.fill_debug_info(&mut info);
        }
        info
    }

    /// Detach the current forwarder and socket under a short lock, then do
    /// the blocking part (joining pumps, closing the fd) with no lock held.
    fn shutdown_packet_forwarder(&self) {
        let (forwarder, socket) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.forwarder.take(), inner.network_socket.take())
        };
        if let Some(mut forwarder) = forwarder {
            self.logger
                .info(Facility::Datapath, "stopping packet forwarder");
            forwarder.stop();
        }
        if let Some(socket) = socket {
            self.logger
                .info(Facility::Datapath, "closing network socket");
            if let Err(e) = socket.close() {
                self.logger
                    .error(Facility::Datapath, &format!("closing network socket: {e}"));
            }
        }
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.forwarder_generation.load(Ordering::SeqCst) == generation
    }

    fn post_notification(
        &self,
        deliver: impl FnOnce(&dyn DatapathNotification) + Send + 'static,
    ) {
        let handler = self.notification.lock().unwrap().clone();
        match handler {
            Some(handler) => self.executor.post(move || deliver(handler.as_ref())),
            None => {
                debug_assert!(false, "notification handler not registered");
                self.logger.error(
                    Facility::Datapath,
                    "dropping event: notification handler not registered",
                );
            }
        }
    }
}

impl ForwarderNotification for IpSecDatapath {
    fn forwarder_connected(&self, generation: u64) {
        if !self.is_current_generation(generation) {
            self.logger.debug(
                Facility::Datapath,
                "ignoring connected event from a replaced forwarder",
            );
            return;
        }
        self.logger
            .notice(Facility::Datapath, "packet forwarder connected");
        self.post_notification(|n| n.datapath_established());
    }

    fn forwarder_failed(&self, generation: u64, status: DatapathError) {
        if !self.is_current_generation(generation) {
            self.logger.debug(
                Facility::Datapath,
                "ignoring failure event from a replaced forwarder",
            );
            return;
        }
        self.logger.warning(
            Facility::Datapath,
            &format!("packet forwarder failed: {status}"),
        );
        self.stop();
        self.post_notification(move |n| n.datapath_failed(status));
    }

    fn forwarder_permanent_failure(&self, generation: u64, status: DatapathError) {
        if !self.is_current_generation(generation) {
            self.logger.debug(
                Facility::Datapath,
                "ignoring permanent failure event from a replaced forwarder",
            );
            return;
        }
        self.logger.warning(
            Facility::Datapath,
            &format!("packet forwarder permanently failed: {status}"),
        );
        self.stop();
        self.post_notification(move |n| n.datapath_permanent_failure(status));
    }
}
