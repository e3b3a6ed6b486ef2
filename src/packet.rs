// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet buffers shuttled between the tunnel and the network socket.
//!
//! A packet owns its payload and optionally a release hook that runs exactly
//! once when the packet is dropped, wherever that happens. The hook is how a
//! caller-supplied buffer pool gets its memory back without the endpoints
//! knowing anything about pooling.

use crate::IpProtocol;
use std::fmt;

/// Single byte emitted uplink when the tunnel read times out. The egress
/// node recognizes it and refreshes NAT state; it must stay bit-exact.
pub const KEEPALIVE_PAYLOAD: u8 = 0xFF;

/// An owned IP packet (or the keepalive marker) in flight between endpoints.
pub struct Packet {
    data: Vec<u8>,
    ip_protocol: IpProtocol,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Packet {
    pub fn new(data: Vec<u8>, ip_protocol: IpProtocol) -> Self {
        Self {
            data,
            ip_protocol,
            release: None,
        }
    }

    /// Attach a release hook that runs exactly once when the packet drops.
    pub fn with_release(
        data: Vec<u8>,
        ip_protocol: IpProtocol,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            data,
            ip_protocol,
            release: Some(Box::new(release)),
        }
    }

    /// The keepalive marker: one `0xFF` byte, unknown family.
    pub fn keepalive() -> Self {
        Self::new(vec![KEEPALIVE_PAYLOAD], IpProtocol::Unknown)
    }

    pub fn is_keepalive(&self) -> bool {
        self.ip_protocol == IpProtocol::Unknown
            && self.data.len() == 1
            && self.data[0] == KEEPALIVE_PAYLOAD
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ip_protocol(&self) -> IpProtocol {
        self.ip_protocol
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("ip_protocol", &self.ip_protocol)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}
