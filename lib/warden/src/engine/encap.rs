// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP-in-IP encapsulation toward a grantor.
//!
//! The outer header carries the gateway's verdict: its DSCP bits are
//! the priority channel the grantors read. The contract is write-only
//! on the outer headers; the inner packet is untouched.

use super::packet::PktBuf;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::Ipv6Repr;
use warden_api::AddrPair;
use warden_api::MacAddr;

/// TTL of outer IPv4 headers.
pub const IPV4_DEFAULT_TTL: u8 = 64;

/// Hop limit of outer IPv6 headers.
pub const IPV6_DEFAULT_HOP_LIMIT: u8 = 0xFF;

// Protocol numbers for IP-in-IP payloads.
const IPPROTO_IPIP: u8 = 4;
const IPPROTO_IPV6: u8 = 41;

const ETHER_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;

/// Where and how to reach the grantor that owns a flow. The outer
/// address pair runs from the back interface's address to the tunnel
/// endpoint; the MACs are the back interface's own and the next hop's.
#[derive(Clone, Debug)]
pub struct TunnelInfo {
    pub outer: AddrPair,
    pub source_mac: MacAddr,
    pub nexthop_mac: MacAddr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncapError {
    /// The buffer has no room left in front for the outer header.
    NoHeadroom,
    /// The frame to be encapsulated is not an IP packet.
    NotIp,
}

impl core::fmt::Display for EncapError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::NoHeadroom => write!(f, "no headroom for outer header"),
            Self::NotIp => write!(f, "inner frame is not IP"),
        }
    }
}

/// Prepend an outer Ethernet + IP header carrying `dscp`, addressed
/// per `tunnel`.
///
/// The frame grows by exactly the outer IP header: the new Ethernet
/// header lands where the old one can be reclaimed, and the inner
/// packet starts at its own IP header.
pub fn encapsulate(
    pkt: &mut PktBuf,
    dscp: u8,
    tunnel: &TunnelInfo,
) -> Result<(), EncapError> {
    debug_assert!(dscp < 64);

    let inner_proto = {
        let frame = EthernetFrame::new_checked(pkt.bytes())
            .map_err(|_| EncapError::NotIp)?;
        match frame.ethertype() {
            EthernetProtocol::Ipv4 => IPPROTO_IPIP,
            EthernetProtocol::Ipv6 => IPPROTO_IPV6,
            _ => return Err(EncapError::NotIp),
        }
    };

    // L3 length of the inner packet, which becomes the outer payload.
    let inner_len = pkt.len() - ETHER_HDR_LEN;

    let outer_len = match tunnel.outer {
        AddrPair::V4 { .. } => IPV4_HDR_LEN,
        AddrPair::V6 { .. } => IPV6_HDR_LEN,
    };
    pkt.prepend(outer_len).map_err(|_| EncapError::NoHeadroom)?;
    let bytes = pkt.bytes_mut();

    let eth = EthernetRepr {
        src_addr: tunnel.source_mac.into(),
        dst_addr: tunnel.nexthop_mac.into(),
        ethertype: match tunnel.outer {
            AddrPair::V4 { .. } => EthernetProtocol::Ipv4,
            AddrPair::V6 { .. } => EthernetProtocol::Ipv6,
        },
    };
    eth.emit(&mut EthernetFrame::new_unchecked(&mut bytes[..ETHER_HDR_LEN]));

    let l3 = &mut bytes[ETHER_HDR_LEN..];
    match tunnel.outer {
        AddrPair::V4 { src, dst } => {
            let repr = Ipv4Repr {
                src_addr: src.into(),
                dst_addr: dst.into(),
                next_header: IpProtocol::from(inner_proto),
                payload_len: inner_len,
                hop_limit: IPV4_DEFAULT_TTL,
            };
            let mut outer =
                Ipv4Packet::new_unchecked(&mut l3[..IPV4_HDR_LEN]);
            repr.emit(&mut outer, &ChecksumCapabilities::default());
            // DSCP sits in the top six bits of the ToS byte; patching
            // it invalidates the checksum just written.
            l3[1] = dscp << 2;
            Ipv4Packet::new_unchecked(&mut l3[..IPV4_HDR_LEN])
                .fill_checksum();
        }
        AddrPair::V6 { src, dst } => {
            let repr = Ipv6Repr {
                src_addr: src.into(),
                dst_addr: dst.into(),
                next_header: IpProtocol::from(inner_proto),
                payload_len: inner_len,
                hop_limit: IPV6_DEFAULT_HOP_LIMIT,
            };
            let mut outer =
                Ipv6Packet::new_unchecked(&mut l3[..IPV6_HDR_LEN]);
            repr.emit(&mut outer);
            // DSCP is bits 4..10 of the version/class/flow word.
            l3[0] = 0x60 | (dscp >> 2);
            l3[1] = (dscp & 0x03) << 6;
        }
    }

    Ok(())
}

/// The DSCP an encapsulated packet carries, straight from the outer
/// header bits.
pub fn outer_dscp(pkt: &PktBuf) -> Option<u8> {
    let bytes = pkt.bytes();
    let frame = EthernetFrame::new_checked(bytes).ok()?;
    match frame.ethertype() {
        EthernetProtocol::Ipv4 => Some(bytes[ETHER_HDR_LEN + 1] >> 2),
        EthernetProtocol::Ipv6 => {
            let b0 = bytes[ETHER_HDR_LEN];
            let b1 = bytes[ETHER_HDR_LEN + 1];
            Some(((b0 & 0x0F) << 2) | (b1 >> 6))
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::packet::PKT_HEADROOM;
    use warden_api::Ipv4Addr;
    use warden_api::Ipv6Addr;

    fn inner_v4_frame() -> Vec<u8> {
        let src: Ipv4Addr = "198.51.100.7".parse().unwrap();
        let dst: Ipv4Addr = "203.0.113.1".parse().unwrap();
        let repr = Ipv4Repr {
            src_addr: src.into(),
            dst_addr: dst.into(),
            next_header: IpProtocol::Udp,
            payload_len: 32,
            hop_limit: 64,
        };
        let mut buf = vec![0u8; ETHER_HDR_LEN + IPV4_HDR_LEN + 32];
        let eth = EthernetRepr {
            src_addr: MacAddr::from([2, 0, 0, 0, 0, 1]).into(),
            dst_addr: MacAddr::from([2, 0, 0, 0, 0, 2]).into(),
            ethertype: EthernetProtocol::Ipv4,
        };
        eth.emit(&mut EthernetFrame::new_unchecked(&mut buf));
        let mut ip = Ipv4Packet::new_unchecked(&mut buf[ETHER_HDR_LEN..]);
        repr.emit(&mut ip, &ChecksumCapabilities::default());
        buf
    }

    fn v4_tunnel() -> TunnelInfo {
        TunnelInfo {
            outer: AddrPair::V4 {
                src: "10.99.0.1".parse().unwrap(),
                dst: "10.99.0.254".parse().unwrap(),
            },
            source_mac: MacAddr::from([0xA8, 0x40, 0x25, 0, 0, 0x01]),
            nexthop_mac: MacAddr::from([0xA8, 0x40, 0x25, 0, 0, 0x02]),
        }
    }

    #[test]
    fn v4_in_v4() {
        let inner = inner_v4_frame();
        let mut pkt = PktBuf::with_headroom(PKT_HEADROOM, &inner);
        encapsulate(&mut pkt, 13, &v4_tunnel()).unwrap();

        assert_eq!(pkt.len(), inner.len() + IPV4_HDR_LEN);
        let bytes = pkt.bytes();

        let frame = EthernetFrame::new_checked(bytes).unwrap();
        assert_eq!(frame.ethertype(), EthernetProtocol::Ipv4);
        assert_eq!(
            frame.src_addr().0,
            v4_tunnel().source_mac.bytes(),
        );
        assert_eq!(
            frame.dst_addr().0,
            v4_tunnel().nexthop_mac.bytes(),
        );

        let outer = Ipv4Packet::new_checked(frame.payload()).unwrap();
        // Checksum must survive the DSCP patch: parse with full
        // verification.
        let repr = Ipv4Repr::parse(&outer, &ChecksumCapabilities::default())
            .unwrap();
        assert_eq!(repr.next_header, IpProtocol::from(4));
        assert_eq!(
            Ipv4Addr::from(repr.src_addr),
            "10.99.0.1".parse().unwrap(),
        );
        assert_eq!(
            Ipv4Addr::from(repr.dst_addr),
            "10.99.0.254".parse().unwrap(),
        );
        assert_eq!(outer_dscp(&pkt), Some(13));
        assert_eq!(outer.total_len() as usize, pkt.len() - ETHER_HDR_LEN);

        // The inner packet rides behind the outer header, untouched.
        assert_eq!(
            &bytes[ETHER_HDR_LEN + IPV4_HDR_LEN..],
            &inner[ETHER_HDR_LEN..],
        );
    }

    #[test]
    fn v4_in_v6() {
        let inner = inner_v4_frame();
        let mut pkt = PktBuf::with_headroom(PKT_HEADROOM, &inner);
        let tunnel = TunnelInfo {
            outer: AddrPair::V6 {
                src: "fd00:9::1".parse().unwrap(),
                dst: "fd00:9::fe".parse().unwrap(),
            },
            ..v4_tunnel()
        };
        encapsulate(&mut pkt, 63, &tunnel).unwrap();

        assert_eq!(pkt.len(), inner.len() + IPV6_HDR_LEN);
        let frame = EthernetFrame::new_checked(pkt.bytes()).unwrap();
        assert_eq!(frame.ethertype(), EthernetProtocol::Ipv6);
        let outer = Ipv6Packet::new_checked(frame.payload()).unwrap();
        assert_eq!(outer.next_header(), IpProtocol::from(4));
        assert_eq!(outer.hop_limit(), IPV6_DEFAULT_HOP_LIMIT);
        assert_eq!(
            outer.payload_len() as usize,
            inner.len() - ETHER_HDR_LEN,
        );
        assert_eq!(
            Ipv6Addr::from(outer.src_addr()),
            "fd00:9::1".parse().unwrap(),
        );
        assert_eq!(outer_dscp(&pkt), Some(63));
        // Version bits intact after the traffic-class patch.
        assert_eq!(pkt.bytes()[ETHER_HDR_LEN] >> 4, 6);
    }

    #[test]
    fn renewal_and_granted_dscp_distinct() {
        for dscp in [1u8, 2, 3] {
            let inner = inner_v4_frame();
            let mut pkt = PktBuf::with_headroom(PKT_HEADROOM, &inner);
            encapsulate(&mut pkt, dscp, &v4_tunnel()).unwrap();
            assert_eq!(outer_dscp(&pkt), Some(dscp));
        }
    }

    #[test]
    fn no_headroom() {
        let inner = inner_v4_frame();
        let mut pkt = PktBuf::with_headroom(8, &inner);
        assert_eq!(
            encapsulate(&mut pkt, 3, &v4_tunnel()).unwrap_err(),
            EncapError::NoHeadroom,
        );
    }
}
