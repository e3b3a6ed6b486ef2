// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Key material handed to the kernel IPsec transform.

use crate::{Endpoint, IpProtocol};
use std::fmt;
use std::os::fd::RawFd;
use zeroize::Zeroizing;

/// Transform parameters for whichever datapath flavor the control plane
/// negotiated. This crate only consumes the IPsec variant.
#[derive(Debug, Clone)]
pub enum TransformParams {
    IpSec(IpSecTransformParams),
    /// Datagram-bridge sessions (TLS-tunneled); handled by a different
    /// datapath implementation.
    Bridge(BridgeTransformParams),
}

impl TransformParams {
    pub fn ipsec(&self) -> Option<&IpSecTransformParams> {
        match self {
            TransformParams::IpSec(params) => Some(params),
            TransformParams::Bridge(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BridgeTransformParams {
    pub session_token: Vec<u8>,
}

/// Everything the platform needs to install the ESP transforms for one
/// direction pair, plus the socket/network bookkeeping that travels with it.
/// Keys and salts are wiped from memory when the bundle is dropped.
///
/// Once `SwitchNetwork` has run, `uplink_spi` equals the session id and
/// `network_fd` names a socket still owned by the datapath.
#[derive(Clone)]
pub struct IpSecTransformParams {
    pub uplink_spi: u32,
    pub downlink_spi: u32,
    pub uplink_key: Zeroizing<Vec<u8>>,
    pub downlink_key: Zeroizing<Vec<u8>>,
    pub uplink_salt: Zeroizing<Vec<u8>>,
    pub downlink_salt: Zeroizing<Vec<u8>>,
    pub destination: Option<Endpoint>,
    pub destination_address_family: IpProtocol,
    pub network_id: u64,
    pub network_fd: RawFd,
    pub keepalive_interval_secs: u32,
}

impl Default for IpSecTransformParams {
    fn default() -> Self {
        Self {
            uplink_spi: 0,
            downlink_spi: 0,
            uplink_key: Zeroizing::new(Vec::new()),
            downlink_key: Zeroizing::new(Vec::new()),
            uplink_salt: Zeroizing::new(Vec::new()),
            downlink_salt: Zeroizing::new(Vec::new()),
            destination: None,
            destination_address_family: IpProtocol::Unknown,
            network_id: 0,
            network_fd: -1,
            keepalive_interval_secs: 0,
        }
    }
}

// Key and salt bytes must never reach a log line.
impl fmt::Debug for IpSecTransformParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpSecTransformParams")
            .field("uplink_spi", &self.uplink_spi)
            .field("downlink_spi", &self.downlink_spi)
            .field("uplink_key", &format_args!("[{} bytes]", self.uplink_key.len()))
            .field(
                "downlink_key",
                &format_args!("[{} bytes]", self.downlink_key.len()),
            )
            .field(
                "uplink_salt",
                &format_args!("[{} bytes]", self.uplink_salt.len()),
            )
            .field(
                "downlink_salt",
                &format_args!("[{} bytes]", self.downlink_salt.len()),
            )
            .field("destination", &self.destination)
            .field("destination_address_family", &self.destination_address_family)
            .field("network_id", &self.network_id)
            .field("network_fd", &self.network_fd)
            .field("keepalive_interval_secs", &self.keepalive_interval_secs)
            .finish()
    }
}
