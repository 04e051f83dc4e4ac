// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP address types and the flow key the data plane is sharded on.

use crate::mac::MacAddr;
use alloc::string::String;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// An IPv4 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(C)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    /// The unspecified IPv4 address, i.e. `0.0.0.0`.
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }

    /// Return the address after applying the network mask.
    pub fn mask(mut self, mask: u8) -> Result<Self, String> {
        if mask > 32 {
            return Err(format!("bad mask: {mask}"));
        }

        if mask == 0 {
            self.inner.fill(0);
            return Ok(self);
        }

        let mut n = u32::from_be_bytes(self.inner);
        n &= u32::MAX << (32 - u32::from(mask));
        self.inner = n.to_be_bytes();
        Ok(self)
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl From<core::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip: core::net::Ipv4Addr) -> Self {
        Self { inner: ip.octets() }
    }
}

impl From<Ipv4Addr> for core::net::Ipv4Addr {
    fn from(ip: Ipv4Addr) -> Self {
        ip.inner.into()
    }
}

impl From<smoltcp::wire::Ipv4Address> for Ipv4Addr {
    fn from(ip: smoltcp::wire::Ipv4Address) -> Self {
        Self { inner: ip.0 }
    }
}

impl From<Ipv4Addr> for smoltcp::wire::Ipv4Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip.inner)
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip = s
            .parse::<core::net::Ipv4Addr>()
            .map_err(|e| format!("{e}: {s}"))?;
        Ok(ip.into())
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.inner[0], self.inner[1], self.inner[2], self.inner[3],
        )
    }
}

impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr {{ inner: {self} }}")
    }
}

/// An IPv6 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(C)]
pub struct Ipv6Addr {
    inner: [u8; 16],
}

impl Ipv6Addr {
    /// The unspecified IPv6 address, i.e., `::` or all zeros.
    pub const ANY_ADDR: Self = Self { inner: [0; 16] };

    /// The All-Nodes multicast address, used in the Neighbor Discovery
    /// Protocol.
    pub const ALL_NODES: Self = Self::from_const([0xff02, 0, 0, 0, 0, 0, 0, 1]);

    /// Generate an IPv6 address via an EUI-64 transform, from a MAC
    /// address. The generated address has link-local scope.
    ///
    /// See [RFC 4291] for details of the transformation applied.
    ///
    /// [RFC 4291]: https://www.rfc-editor.org/rfc/rfc4291#page-20
    pub fn from_eui64(mac: &MacAddr) -> Self {
        let mac = mac.bytes();
        // Invert the locally-administered bit in the first octet of the MAC
        let mac0 = mac[0] ^ 0b10;
        let bytes: [u8; 16] = [
            0xfe, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, mac0, mac[1],
            mac[2], 0xff, 0xfe, mac[3], mac[4], mac[5],
        ];
        Self::from(bytes)
    }

    /// Construct an address from eight 16-bit groups, as written.
    pub const fn from_const(groups: [u16; 8]) -> Self {
        let mut inner = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            let b = groups[i].to_be_bytes();
            inner[i * 2] = b[0];
            inner[i * 2 + 1] = b[1];
            i += 1;
        }
        Self { inner }
    }

    /// Return the multicast MAC address associated with this multicast
    /// IPv6 address. If the IPv6 address is not multicast, None will be
    /// returned.
    ///
    /// See [RFC 2464 §7] for details.
    ///
    /// [RFC 2464 §7]: https://www.rfc-editor.org/rfc/rfc2464
    pub const fn multicast_mac(&self) -> Option<MacAddr> {
        if self.is_multicast() {
            Some(self.unchecked_multicast_mac())
        } else {
            None
        }
    }

    /// Return the multicast MAC address associated with this multicast
    /// IPv6 address, without checking if this IP address is a multicast
    /// address.
    ///
    /// See [RFC 2464 §7] for details.
    ///
    /// [RFC 2464 §7]: https://www.rfc-editor.org/rfc/rfc2464
    pub const fn unchecked_multicast_mac(&self) -> MacAddr {
        let bytes = &self.inner;
        MacAddr::from_const([
            0x33, 0x33, bytes[12], bytes[13], bytes[14], bytes[15],
        ])
    }

    /// Return the solicited-node multicast IPv6 address corresponding
    /// to `self`.
    ///
    /// See [RFC 4291 §2.7.1] for details.
    ///
    /// [RFC 4291 §2.7.1]: https://www.rfc-editor.org/rfc/rfc4291#section-2.7.1
    pub const fn solicited_node_multicast(&self) -> Ipv6Addr {
        let bytes = &self.inner;
        let w0 = u16::from_be_bytes([0xff, bytes[13]]);
        let w1 = u16::from_be_bytes([bytes[14], bytes[15]]);
        Self::from_const([0xff02, 0, 0, 0, 0, 1, w0, w1])
    }

    /// Return `true` if this is a solicited node multicast address.
    pub fn is_solicited_node_multicast(&self) -> bool {
        const EXPECTED: &[u8] =
            &[0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff];
        &self.inner[..EXPECTED.len()] == EXPECTED
    }

    /// Return `true` if this is a multicast IPv6 address, and `false`
    /// otherwise.
    pub const fn is_multicast(&self) -> bool {
        self.inner[0] == 0xFF
    }

    /// Return `true` if this address has link-local scope (`fe80::/10`).
    pub const fn is_link_local(&self) -> bool {
        self.inner[0] == 0xFE && self.inner[1] & 0xC0 == 0x80
    }

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 16] {
        self.inner
    }

    /// Return the address after applying the network mask.
    pub fn mask(mut self, mask: u8) -> Result<Self, String> {
        if mask > 128 {
            return Err(format!("bad mask: {mask}"));
        }

        if mask == 128 {
            return Ok(self);
        }

        if mask == 0 {
            self.inner.fill(0);
            return Ok(self);
        }

        let mut n = u128::from_be_bytes(self.inner);
        n &= u128::MAX << (128 - u32::from(mask));
        self.inner = n.to_be_bytes();
        Ok(self)
    }
}

impl From<[u8; 16]> for Ipv6Addr {
    fn from(bytes: [u8; 16]) -> Self {
        Self { inner: bytes }
    }
}

impl From<core::net::Ipv6Addr> for Ipv6Addr {
    fn from(ip: core::net::Ipv6Addr) -> Self {
        Self { inner: ip.octets() }
    }
}

impl From<Ipv6Addr> for core::net::Ipv6Addr {
    fn from(ip: Ipv6Addr) -> Self {
        ip.inner.into()
    }
}

impl From<smoltcp::wire::Ipv6Address> for Ipv6Addr {
    fn from(ip: smoltcp::wire::Ipv6Address) -> Self {
        Self { inner: ip.0 }
    }
}

impl From<Ipv6Addr> for smoltcp::wire::Ipv6Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.inner)
    }
}

impl FromStr for Ipv6Addr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip = s
            .parse::<core::net::Ipv6Addr>()
            .map_err(|e| format!("{e}: {s}"))?;
        Ok(ip.into())
    }
}

impl Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", core::net::Ipv6Addr::from(*self))
    }
}

impl Debug for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv6Addr {{ inner: {self} }}")
    }
}

/// An IP address of either family.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum IpAddr {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
}

impl From<Ipv4Addr> for IpAddr {
    fn from(ip: Ipv4Addr) -> Self {
        Self::Ip4(ip)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(ip: Ipv6Addr) -> Self {
        Self::Ip6(ip)
    }
}

impl Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ip4(ip) => write!(f, "{ip}"),
            Self::Ip6(ip) => write!(f, "{ip}"),
        }
    }
}

/// A source-destination address pair of one family, used to avoid
/// duplicating the discriminator across the two addresses.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum AddrPair {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

impl AddrPair {
    pub fn mirror(self) -> Self {
        match self {
            Self::V4 { src, dst } => Self::V4 { src: dst, dst: src },
            Self::V6 { src, dst } => Self::V6 { src: dst, dst: src },
        }
    }
}

/// The maximum number of bytes a flow key feeds into the receive-side
/// scaling hash: an IPv6 source + destination pair.
pub const FLOW_KEY_MAX_RSS_LEN: usize = 32;

/// The key per-flow state is sharded on: an ordered pair of IP
/// endpoints. Compared bitwise; hashed with the same keyed hash the
/// NIC runs, so the worker a packet lands on owns the flow's entry.
///
/// An upper-layer descriptor (ports) is an anticipated extension and
/// would slot in beside `addrs`.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct FlowKey {
    pub addrs: AddrPair,
}

impl FlowKey {
    pub fn src(&self) -> IpAddr {
        match self.addrs {
            AddrPair::V4 { src, .. } => src.into(),
            AddrPair::V6 { src, .. } => src.into(),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self.addrs {
            AddrPair::V4 { dst, .. } => dst.into(),
            AddrPair::V6 { dst, .. } => dst.into(),
        }
    }

    /// Swap source and destination.
    pub fn mirror(self) -> Self {
        Self { addrs: self.addrs.mirror() }
    }

    /// Write the hash input for this key (source then destination, in
    /// wire order) into `buf`, returning the filled prefix.
    pub fn rss_input<'a>(
        &self,
        buf: &'a mut [u8; FLOW_KEY_MAX_RSS_LEN],
    ) -> &'a [u8] {
        match self.addrs {
            AddrPair::V4 { src, dst } => {
                buf[0..4].copy_from_slice(&src.bytes());
                buf[4..8].copy_from_slice(&dst.bytes());
                &buf[..8]
            }
            AddrPair::V6 { src, dst } => {
                buf[0..16].copy_from_slice(&src.bytes());
                buf[16..32].copy_from_slice(&dst.bytes());
                &buf[..32]
            }
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.src(), self.dst())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn v4_mask() {
        let ip: Ipv4Addr = "192.168.2.77".parse().unwrap();
        assert_eq!(ip.mask(24).unwrap(), "192.168.2.0".parse().unwrap());
        assert_eq!(ip.mask(0).unwrap(), Ipv4Addr::ANY_ADDR);
        assert_eq!(ip.mask(32).unwrap(), ip);
        assert!(ip.mask(33).is_err());
    }

    #[test]
    fn v6_mask() {
        let ip: Ipv6Addr = "fd00:1122:3344:0201::77".parse().unwrap();
        assert_eq!(
            ip.mask(64).unwrap(),
            "fd00:1122:3344:0201::".parse().unwrap(),
        );
        assert_eq!(ip.mask(0).unwrap(), Ipv6Addr::ANY_ADDR);
        assert_eq!(ip.mask(128).unwrap(), ip);
    }

    #[test]
    fn eui64_link_local() {
        let mac = MacAddr::from([0xA8, 0x40, 0x25, 0x00, 0x00, 0x63]);
        let ll = Ipv6Addr::from_eui64(&mac);
        assert_eq!(ll, "fe80::aa40:25ff:fe00:63".parse().unwrap());
        assert!(ll.is_link_local());
    }

    #[test]
    fn solicited_node_multicast() {
        let addr: Ipv6Addr = "fd00::1:2:3".parse().unwrap();
        let expected: Ipv6Addr = "ff02::1:ff02:3".parse().unwrap();
        assert_eq!(addr.solicited_node_multicast(), expected);
        assert!(expected.is_solicited_node_multicast());
        assert!(!addr.is_solicited_node_multicast());
        assert_eq!(
            expected.multicast_mac().unwrap(),
            MacAddr::from([0x33, 0x33, 0xFF, 0x02, 0x00, 0x03]),
        );
        assert!(addr.multicast_mac().is_none());
    }

    #[test]
    fn rss_input_order() {
        let key = FlowKey {
            addrs: AddrPair::V4 {
                src: "10.0.0.1".parse().unwrap(),
                dst: "10.0.0.2".parse().unwrap(),
            },
        };
        let mut buf = [0u8; FLOW_KEY_MAX_RSS_LEN];
        assert_eq!(key.rss_input(&mut buf), &[10, 0, 0, 1, 10, 0, 0, 2]);

        let mirrored = key.mirror();
        let mut buf = [0u8; FLOW_KEY_MAX_RSS_LEN];
        assert_eq!(mirrored.rss_input(&mut buf), &[10, 0, 0, 2, 10, 0, 0, 1]);
    }
}
