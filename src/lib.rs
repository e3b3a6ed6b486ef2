// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Client-side IPsec datapath.
//!
//! This crate owns the two fd-backed endpoints of an encrypted tunnel — a
//! TUN device facing the host network stack and a UDP socket facing the
//! egress node — and moves raw IP packets between them on plain OS threads.
//! The kernel performs the actual ESP transform; the crate's job is the
//! lifecycle around it: cancellable blocking I/O, keepalives, MTU tracking,
//! network switches, rekeys, and race-free teardown.
//!
//! The session controller drives [`datapath::IpSecDatapath`] and receives
//! state changes through a [`notification::SerialExecutor`] so its handlers
//! never run reentrantly from inside a datapath call.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;

pub mod config;
pub mod datapath;
pub mod logging;
pub mod notification;
pub mod packet;
pub mod status;

pub use config::DatapathConfig;
pub use datapath::{DatapathNotification, IpSecDatapath, VpnService};
pub use packet::Packet;
pub use status::{DatapathError, ErrorKind};

/// Address family of a packet or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    V4,
    V6,
    /// Family not known or not applicable (e.g. the keepalive marker).
    Unknown,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::V4 => write!(f, "IPv4"),
            IpProtocol::V6 => write!(f, "IPv6"),
            IpProtocol::Unknown => write!(f, "unknown"),
        }
    }
}

/// Destination the encrypted traffic is sent to. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    address: String,
    port: u16,
    ip_protocol: IpProtocol,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16, ip_protocol: IpProtocol) -> Self {
        Self {
            address: address.into(),
            port,
            ip_protocol,
        }
    }

    /// Parse `"host:port"` / `"[v6]:port"` and derive the family from the
    /// address literal.
    pub fn from_host_port(host_port: &str) -> Result<Self, DatapathError> {
        let addr: SocketAddr = host_port.parse().map_err(|e| {
            DatapathError::invalid_argument(format!("malformed endpoint {host_port:?}: {e}"))
        })?;
        let ip_protocol = if addr.is_ipv4() {
            IpProtocol::V4
        } else {
            IpProtocol::V6
        };
        Ok(Self {
            address: addr.ip().to_string(),
            port: addr.port(),
            ip_protocol,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip_protocol(&self) -> IpProtocol {
        self.ip_protocol
    }

    /// Resolve to a socket address for connect(2).
    pub fn socket_addr(&self) -> Result<SocketAddr, DatapathError> {
        let ip = self.address.parse().map_err(|e| {
            DatapathError::invalid_argument(format!(
                "endpoint address {:?} is not an IP literal: {e}",
                self.address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip_protocol {
            IpProtocol::V6 => write!(f, "[{}]:{}", self.address, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

/// Kind of host network backing a protected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NetworkType {
    Cellular,
    Wifi,
    #[default]
    Unknown,
}

/// Identity of the device network the datapath should ride on. Provided by
/// the platform whenever the active network changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkInfo {
    pub network_id: u64,
    #[serde(default)]
    pub network_type: NetworkType,
}

impl NetworkInfo {
    pub fn new(network_id: u64, network_type: NetworkType) -> Self {
        Self {
            network_id,
            network_type,
        }
    }
}

/// Parameters for the host-side TUN device the platform allocates on our
/// behalf: addresses and routes to install, DNS to push, interface MTU.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunFdData {
    pub addresses: Vec<String>,
    pub dns_servers: Vec<String>,
    pub routes: Vec<String>,
    pub mtu: u32,
}

/// Egress negotiation summary handed down by the session controller when the
/// datapath starts. The IPsec datapath keys itself from the transform params
/// instead, but the interface keeps parity with other datapath kinds.
#[derive(Debug, Clone, Default)]
pub struct EgressInfo {
    /// Egress endpoints offered by the control plane, in preference order.
    pub endpoints: Vec<Endpoint>,
}

/// Point-in-time snapshot of datapath state, for bug reports and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathDebugInfo {
    pub uplink_packets_read: u64,
    pub uplink_packets_written: u64,
    pub downlink_packets_read: u64,
    pub downlink_packets_written: u64,
    pub uplink_spi: u32,
    pub downlink_spi: u32,
    pub network_id: u64,
    pub network_fd: RawFd,
    pub path_mtu: u32,
    pub tunnel_mtu: u32,
}
