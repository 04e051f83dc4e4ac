// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packet buffers and the zero-copy view the flow machinery keys on.

use super::ParseError;
use crate::net::Iface;
use alloc::vec::Vec;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::Icmpv6Message;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::IpAddress;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv6Packet;
use warden_api::AddrPair;
use warden_api::FlowKey;
use warden_api::Ipv6Addr;

/// Headroom reserved in front of received frames, sized for the
/// largest outer header encapsulation prepends (IPv6, 40 bytes) with
/// room to spare.
pub const PKT_HEADROOM: usize = 64;

/// Minimum length of a neighbor discovery frame: Ethernet + IPv6 +
/// ICMPv6 + the fixed neighbor message (4 reserved/flag bytes and the
/// 16-byte target).
pub const ND_NEIGH_PKT_MIN_LEN: usize = 14 + 40 + 4 + 20;

/// An owned frame with headroom for header prepends.
///
/// Stands in for a driver's receive buffer: the payload occupies the
/// tail of a fixed allocation and encapsulation grows it toward the
/// front. Dropping the buffer frees it; a buffer handed to a transmit
/// burst is owned by the device from then on.
#[derive(Clone, Debug)]
pub struct PktBuf {
    data: Vec<u8>,
    head: usize,
}

impl PktBuf {
    /// Wrap frame bytes with no headroom.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::with_headroom(0, bytes)
    }

    /// Wrap frame bytes, reserving `headroom` bytes in front.
    pub fn with_headroom(headroom: usize, bytes: &[u8]) -> Self {
        let mut data = vec![0u8; headroom + bytes.len()];
        data[headroom..].copy_from_slice(bytes);
        Self { data, head: headroom }
    }

    /// A zeroed frame of `len` bytes behind `headroom` of headroom.
    pub fn alloc(headroom: usize, len: usize) -> Self {
        Self { data: vec![0u8; headroom + len], head: headroom }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[self.head..]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Grow the frame by `n` bytes at the front, consuming headroom.
    /// The new bytes are whatever the headroom held; callers overwrite
    /// them.
    pub fn prepend(&mut self, n: usize) -> Result<(), ParseError> {
        if n > self.head {
            return Err(ParseError::Truncated);
        }
        self.head -= n;
        Ok(())
    }
}

/// What one parse pass learned about a frame: its flow key plus the
/// protocol hints later stages branch on.
#[derive(Clone, Copy, Debug)]
pub struct PacketView {
    pub flow: FlowKey,
    /// Transport protocol number from the fixed IP header.
    pub next_hdr: u8,
    /// Length of the L3 portion (IP header + payload) the header
    /// claims.
    pub l3_len: u16,
}

// IPv6 extension headers (and mobility); anything here means the
// fixed-header-only contract is violated.
fn is_ipv6_ext_header(proto: u8) -> bool {
    matches!(proto, 0 | 43 | 44 | 50 | 51 | 60 | 135)
}

/// Parse the Ethernet and fixed IP headers of `pkt` into a
/// [`PacketView`]. Non-IP frames and IPv6 frames with extension
/// headers are rejected.
pub fn extract(pkt: &PktBuf) -> Result<PacketView, ParseError> {
    let frame = EthernetFrame::new_checked(pkt.bytes())
        .map_err(|_| ParseError::Truncated)?;

    match frame.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(frame.payload())
                .map_err(|_| ParseError::Truncated)?;
            Ok(PacketView {
                flow: FlowKey {
                    addrs: AddrPair::V4 {
                        src: ip.src_addr().into(),
                        dst: ip.dst_addr().into(),
                    },
                },
                next_hdr: ip.next_header().into(),
                l3_len: ip.total_len(),
            })
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(frame.payload())
                .map_err(|_| ParseError::Truncated)?;
            let next_hdr: u8 = ip.next_header().into();
            if is_ipv6_ext_header(next_hdr) {
                return Err(ParseError::ExtensionHeader(next_hdr));
            }
            Ok(PacketView {
                flow: FlowKey {
                    addrs: AddrPair::V6 {
                        src: ip.src_addr().into(),
                        dst: ip.dst_addr().into(),
                    },
                },
                next_hdr,
                l3_len: 40 + ip.payload_len(),
            })
        }
        other => Err(ParseError::NotIp(other.into())),
    }
}

/// Is this frame a neighbor discovery message addressed to `iface`?
/// True when it is ICMPv6 neighbor solicitation or advertisement and
/// its destination is one of the addresses the interface answers for.
pub fn is_neighbor_discovery(
    view: &PacketView,
    pkt: &PktBuf,
    iface: &Iface,
) -> bool {
    const IPPROTO_ICMPV6: u8 = 58;

    if pkt.len() < ND_NEIGH_PKT_MIN_LEN || view.next_hdr != IPPROTO_ICMPV6 {
        return false;
    }

    let dst: Ipv6Addr = match view.flow.addrs {
        AddrPair::V6 { dst, .. } => dst,
        AddrPair::V4 { .. } => return false,
    };

    // The length check above covers the fixed headers.
    let icmp = Icmpv6Packet::new_unchecked(&pkt.bytes()[14 + 40..]);
    let is_neigh_msg = matches!(
        icmp.msg_type(),
        Icmpv6Message::NeighborSolicit | Icmpv6Message::NeighborAdvert,
    );

    is_neigh_msg && iface.is_nd_target(&dst)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::Ipv4IfaceCfg;
    use crate::net::Ipv6IfaceCfg;
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::EthernetAddress;
    use smoltcp::wire::EthernetRepr;
    use smoltcp::wire::Icmpv6Repr;
    use smoltcp::wire::IpProtocol;
    use smoltcp::wire::Ipv6Address;
    use smoltcp::wire::Ipv6Repr;
    use smoltcp::wire::NdiscRepr;
    use smoltcp::wire::RawHardwareAddress;
    use warden_api::Ipv4Addr;
    use warden_api::MacAddr;

    fn eth(ethertype: EthernetProtocol, payload: &[u8]) -> PktBuf {
        let repr = EthernetRepr {
            src_addr: EthernetAddress([2, 0, 0, 0, 0, 1]),
            dst_addr: EthernetAddress([2, 0, 0, 0, 0, 2]),
            ethertype,
        };
        let mut buf = vec![0u8; 14 + payload.len()];
        let mut frame = EthernetFrame::new_unchecked(&mut buf);
        repr.emit(&mut frame);
        frame.payload_mut().copy_from_slice(payload);
        PktBuf::with_headroom(PKT_HEADROOM, &buf)
    }

    fn udp4_frame(src: &str, dst: &str, body_len: usize) -> PktBuf {
        use smoltcp::wire::Ipv4Repr;
        let src: Ipv4Addr = src.parse().unwrap();
        let dst: Ipv4Addr = dst.parse().unwrap();
        let repr = Ipv4Repr {
            src_addr: src.into(),
            dst_addr: dst.into(),
            next_header: IpProtocol::Udp,
            payload_len: body_len,
            hop_limit: 64,
        };
        let mut l3 = vec![0u8; 20 + body_len];
        let mut ip = Ipv4Packet::new_unchecked(&mut l3);
        repr.emit(&mut ip, &ChecksumCapabilities::default());
        eth(EthernetProtocol::Ipv4, &l3)
    }

    fn ns_frame(target: &str, dst: &str) -> PktBuf {
        let target: Ipv6Addr = target.parse::<Ipv6Addr>().unwrap();
        let src = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x99);
        let dst: Ipv6Address = dst.parse::<Ipv6Addr>().unwrap().into();
        let icmp = Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit {
            target_addr: target.into(),
            lladdr: Some(RawHardwareAddress::from_bytes(&[2, 0, 0, 0, 0, 1])),
        });
        let ip = Ipv6Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::Icmpv6,
            payload_len: icmp.buffer_len(),
            hop_limit: 255,
        };
        let mut l3 = vec![0u8; ip.buffer_len() + icmp.buffer_len()];
        let mut ip_pkt = Ipv6Packet::new_unchecked(&mut l3);
        ip.emit(&mut ip_pkt);
        let mut icmp_pkt = Icmpv6Packet::new_unchecked(ip_pkt.payload_mut());
        icmp.emit(
            &IpAddress::Ipv6(src),
            &IpAddress::Ipv6(dst),
            &mut icmp_pkt,
            &ChecksumCapabilities::default(),
        );
        eth(EthernetProtocol::Ipv6, &l3)
    }

    fn nd_iface() -> Iface {
        let mac = MacAddr::from([0xA8, 0x40, 0x25, 0x00, 0x00, 0x63]);
        Iface::new(
            "front",
            0,
            mac,
            1,
            1,
            Some(Ipv4IfaceCfg {
                addr: "10.0.1.1".parse().unwrap(),
                prefix_len: 24,
            }),
            Some(Ipv6IfaceCfg::new("2001:db8::1".parse().unwrap(), 64, &mac)),
        )
    }

    #[test]
    fn extract_v4() {
        let pkt = udp4_frame("198.51.100.7", "203.0.113.1", 100);
        let view = extract(&pkt).unwrap();
        assert_eq!(view.next_hdr, 17);
        assert_eq!(view.l3_len, 120);
        match view.flow.addrs {
            AddrPair::V4 { src, dst } => {
                assert_eq!(src, "198.51.100.7".parse().unwrap());
                assert_eq!(dst, "203.0.113.1".parse().unwrap());
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn extract_rejects_non_ip() {
        let pkt = eth(EthernetProtocol::Arp, &[0u8; 28]);
        assert_eq!(extract(&pkt).unwrap_err(), ParseError::NotIp(0x0806));
    }

    #[test]
    fn extract_rejects_ipv6_ext_header() {
        let src = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 2);
        let ip = Ipv6Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::HopByHop,
            payload_len: 8,
            hop_limit: 64,
        };
        let mut l3 = vec![0u8; ip.buffer_len() + 8];
        let mut ip_pkt = Ipv6Packet::new_unchecked(&mut l3);
        ip.emit(&mut ip_pkt);
        let pkt = eth(EthernetProtocol::Ipv6, &l3);
        assert_eq!(
            extract(&pkt).unwrap_err(),
            ParseError::ExtensionHeader(0),
        );
    }

    #[test]
    fn extract_rejects_truncated() {
        let pkt = eth(EthernetProtocol::Ipv4, &[0u8; 10]);
        assert_eq!(extract(&pkt).unwrap_err(), ParseError::Truncated);
    }

    #[test]
    fn nd_detection() {
        let iface = nd_iface();
        let v6 = iface.v6.as_ref().unwrap();

        // Solicitation to the solicited-node group of the global
        // address.
        let pkt = ns_frame("2001:db8::1", &format!("{}", v6.sn_mc_addr));
        let view = extract(&pkt).unwrap();
        assert!(is_neighbor_discovery(&view, &pkt, &iface));

        // Directly to the link-local unicast.
        let pkt = ns_frame("2001:db8::1", &format!("{}", v6.ll_addr));
        let view = extract(&pkt).unwrap();
        assert!(is_neighbor_discovery(&view, &pkt, &iface));

        // To somebody else entirely.
        let pkt = ns_frame("2001:db8::1", "2001:db8::42");
        let view = extract(&pkt).unwrap();
        assert!(!is_neighbor_discovery(&view, &pkt, &iface));

        // Not ICMPv6 at all.
        let pkt = udp4_frame("198.51.100.7", "203.0.113.1", 64);
        let view = extract(&pkt).unwrap();
        assert!(!is_neighbor_discovery(&view, &pkt, &iface));
    }

    #[test]
    fn prepend_consumes_headroom() {
        let mut pkt = PktBuf::with_headroom(20, &[1, 2, 3]);
        assert_eq!(pkt.len(), 3);
        assert_eq!(pkt.headroom(), 20);
        pkt.prepend(20).unwrap();
        assert_eq!(pkt.len(), 23);
        assert_eq!(pkt.headroom(), 0);
        assert_eq!(&pkt.bytes()[20..], &[1, 2, 3]);
        assert!(pkt.prepend(1).is_err());
    }
}
