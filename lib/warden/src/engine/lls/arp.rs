// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ARP: the IPv4 side of link-layer support.

use super::cache::LinkCache;
use super::cache::LinkFamily;
use super::cache::ObserveSource;
use crate::engine::packet::PktBuf;
use crate::net::Iface;
use crate::net::IfaceId;
use crate::net::NetConfig;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use warden_api::IpAddr;
use warden_api::Ipv4Addr;
use warden_api::MacAddr;

const ETHER_HDR_LEN: usize = 14;
const ARP_PKT_LEN: usize = 28;

/// The IPv4 capability set for the resolution cache.
pub struct ArpFamily;

impl LinkFamily for ArpFamily {
    const NAME: &'static str = "arp";
    type Addr = Ipv4Addr;

    fn iface_enabled(iface: &Iface) -> bool {
        iface.ipv4_enabled()
    }

    fn in_subnet(iface: &Iface, addr: &Ipv4Addr) -> bool {
        iface.in_subnet_v4(addr)
    }

    fn timeout_sec(iface: &Iface) -> u32 {
        iface.arp_cache_timeout_sec
    }

    fn to_ip(addr: &Ipv4Addr) -> IpAddr {
        IpAddr::Ip4(*addr)
    }

    fn solicit_frame(
        iface: &Iface,
        addr: &Ipv4Addr,
        unicast: Option<MacAddr>,
    ) -> PktBuf {
        let spa = match &iface.v4 {
            Some(v4) => v4.addr,
            None => Ipv4Addr::ANY_ADDR,
        };
        gen_arp_frame(
            ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Request,
                source_hardware_addr: iface.mac.into(),
                source_protocol_addr: spa.into(),
                target_hardware_addr: MacAddr::ZERO.into(),
                target_protocol_addr: (*addr).into(),
            },
            iface.mac,
            unicast.unwrap_or(MacAddr::BROADCAST),
        )
    }
}

/// Emit an ARP frame from `repr` with the given Ethernet addressing.
fn gen_arp_frame(repr: ArpRepr, src: MacAddr, dst: MacAddr) -> PktBuf {
    let eth = EthernetRepr {
        src_addr: src.into(),
        dst_addr: dst.into(),
        ethertype: EthernetProtocol::Arp,
    };
    let mut buf = vec![0u8; ETHER_HDR_LEN + ARP_PKT_LEN];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut arp = ArpPacket::new_unchecked(frame.payload_mut());
    repr.emit(&mut arp);
    PktBuf::from_bytes(&buf)
}

/// Generate an ARP reply from SHA/SPA to THA/TPA.
pub fn gen_arp_reply(
    sha: MacAddr,
    spa: Ipv4Addr,
    tha: MacAddr,
    tpa: Ipv4Addr,
) -> PktBuf {
    gen_arp_frame(
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: sha.into(),
            source_protocol_addr: spa.into(),
            target_hardware_addr: tha.into(),
            target_protocol_addr: tpa.into(),
        },
        sha,
        tha,
    )
}

/// Handle one ARP frame received on `iface`: learn what it teaches,
/// and if it asks for this interface's address, produce the reply to
/// transmit.
pub fn process_arp(
    cache: &mut LinkCache<ArpFamily>,
    net: &NetConfig,
    iface_id: IfaceId,
    pkt: &PktBuf,
    now: u64,
) -> Option<PktBuf> {
    let iface = net.iface(iface_id)?;
    let our = iface.v4.as_ref()?.addr;

    let frame = EthernetFrame::new_checked(pkt.bytes()).ok()?;
    let arp = ArpPacket::new_checked(frame.payload()).ok()?;
    let repr = ArpRepr::parse(&arp).ok()?;

    let ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr,
        source_protocol_addr,
        target_protocol_addr,
        ..
    } = repr
    else {
        return None;
    };

    let sha: MacAddr = source_hardware_addr.into();
    let spa: Ipv4Addr = source_protocol_addr.into();
    let tpa: Ipv4Addr = target_protocol_addr.into();

    match operation {
        ArpOperation::Request => {
            // The sender mapping is usable, though nobody vouched for
            // it.
            if spa != Ipv4Addr::ANY_ADDR && iface.in_subnet_v4(&spa) {
                cache.observe(
                    spa,
                    sha,
                    ObserveSource::Unsolicited,
                    now,
                    net,
                    iface_id,
                );
            }
            if tpa == our {
                return Some(gen_arp_reply(iface.mac, our, sha, spa));
            }
            None
        }
        ArpOperation::Reply => {
            let source = if tpa == our {
                ObserveSource::Solicited
            } else {
                // Gratuitous, or meant for someone else on the
                // segment.
                ObserveSource::Unsolicited
            };
            if spa != Ipv4Addr::ANY_ADDR && iface.in_subnet_v4(&spa) {
                cache.observe(spa, sha, source, now, net, iface_id);
            }
            None
        }
        _ => None,
    }
}
