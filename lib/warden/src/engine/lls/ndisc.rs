// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Neighbor discovery: the IPv6 side of link-layer support.

use super::cache::LinkCache;
use super::cache::LinkFamily;
use super::cache::ObserveSource;
use crate::engine::packet::PktBuf;
use crate::net::Iface;
use crate::net::IfaceId;
use crate::net::NetConfig;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::Icmpv6Repr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::Ipv6Repr;
use smoltcp::wire::NdiscNeighborFlags;
use smoltcp::wire::NdiscRepr;
use smoltcp::wire::RawHardwareAddress;
use warden_api::IpAddr;
use warden_api::Ipv6Addr;
use warden_api::MacAddr;

const ETHER_HDR_LEN: usize = 14;

/// Hop limit all neighbor discovery packets carry; receivers drop
/// anything else.
const ND_HOP_LIMIT: u8 = 255;

/// The IPv6 capability set for the resolution cache.
pub struct NdiscFamily;

impl LinkFamily for NdiscFamily {
    const NAME: &'static str = "nd";
    type Addr = Ipv6Addr;

    fn iface_enabled(iface: &Iface) -> bool {
        iface.ipv6_enabled()
    }

    fn in_subnet(iface: &Iface, addr: &Ipv6Addr) -> bool {
        iface.in_subnet_v6(addr)
    }

    fn timeout_sec(iface: &Iface) -> u32 {
        iface.nd_cache_timeout_sec
    }

    fn to_ip(addr: &Ipv6Addr) -> IpAddr {
        IpAddr::Ip6(*addr)
    }

    fn solicit_frame(
        iface: &Iface,
        addr: &Ipv6Addr,
        unicast: Option<MacAddr>,
    ) -> PktBuf {
        let Some(v6) = iface.v6.as_ref() else {
            debug_assert!(false, "ND solicitation on IPv4-only interface");
            return PktBuf::from_bytes(&[]);
        };

        // Link-local targets are solicited from the link-local source
        // so the peer can answer without a route.
        let src_ip =
            if addr.is_link_local() { v6.ll_addr } else { v6.addr };

        let (dst_ip, dst_mac) = match unicast {
            Some(mac) => (*addr, mac),
            None => {
                let sn = addr.solicited_node_multicast();
                (sn, sn.unchecked_multicast_mac())
            }
        };

        let icmp = Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit {
            target_addr: (*addr).into(),
            lladdr: Some(RawHardwareAddress::from_bytes(&iface.mac.bytes())),
        });
        gen_nd_frame(iface.mac, dst_mac, src_ip, dst_ip, &icmp)
    }
}

/// Emit Ethernet + IPv6 + ICMPv6 around a neighbor discovery message.
fn gen_nd_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    icmp: &Icmpv6Repr,
) -> PktBuf {
    let src_addr = src_ip.into();
    let dst_addr = dst_ip.into();

    let eth = EthernetRepr {
        src_addr: src_mac.into(),
        dst_addr: dst_mac.into(),
        ethertype: EthernetProtocol::Ipv6,
    };
    let ip = Ipv6Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp.buffer_len(),
        hop_limit: ND_HOP_LIMIT,
    };

    let mut buf =
        vec![0u8; ETHER_HDR_LEN + ip.buffer_len() + icmp.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut ip_pkt = Ipv6Packet::new_unchecked(frame.payload_mut());
    ip.emit(&mut ip_pkt);
    let mut icmp_pkt = Icmpv6Packet::new_unchecked(ip_pkt.payload_mut());
    icmp.emit(
        &IpAddress::Ipv6(src_addr),
        &IpAddress::Ipv6(dst_addr),
        &mut icmp_pkt,
        &ChecksumCapabilities::default(),
    );
    PktBuf::from_bytes(&buf)
}

/// Build the neighbor advertisement answering a solicitation for
/// `target` on `iface`.
fn gen_neigh_adv(
    iface: &Iface,
    target: Ipv6Addr,
    dst_ip: Ipv6Addr,
    dst_mac: MacAddr,
    solicited: bool,
) -> PktBuf {
    let mut flags = NdiscNeighborFlags::OVERRIDE;
    if solicited {
        flags |= NdiscNeighborFlags::SOLICITED;
    }
    let icmp = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
        flags,
        target_addr: target.into(),
        lladdr: Some(RawHardwareAddress::from_bytes(&iface.mac.bytes())),
    });
    gen_nd_frame(iface.mac, dst_mac, target, dst_ip, &icmp)
}

fn lladdr_to_mac(raw: &RawHardwareAddress) -> Option<MacAddr> {
    let bytes = raw.as_bytes();
    if bytes.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(bytes);
    Some(MacAddr::from(mac))
}

/// Handle one neighbor discovery frame received on `iface`: merge what
/// it teaches into the cache, and answer solicitations for this
/// interface's addresses.
pub fn process_nd(
    cache: &mut LinkCache<NdiscFamily>,
    net: &NetConfig,
    iface_id: IfaceId,
    pkt: &PktBuf,
    now: u64,
) -> Option<PktBuf> {
    let iface = net.iface(iface_id)?;

    let frame = EthernetFrame::new_checked(pkt.bytes()).ok()?;
    if frame.ethertype() != EthernetProtocol::Ipv6 {
        return None;
    }
    let ip = Ipv6Packet::new_checked(frame.payload()).ok()?;
    if ip.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    let src_addr = ip.src_addr();
    let dst_addr = ip.dst_addr();
    let icmp = Icmpv6Packet::new_checked(ip.payload()).ok()?;
    let repr = Icmpv6Repr::parse(
        &IpAddress::Ipv6(src_addr),
        &IpAddress::Ipv6(dst_addr),
        &icmp,
        &ChecksumCapabilities::default(),
    )
    .ok()?;

    let Icmpv6Repr::Ndisc(nd) = repr else {
        return None;
    };

    match nd {
        NdiscRepr::NeighborSolicit { target_addr, lladdr } => {
            let target: Ipv6Addr = target_addr.into();
            let sender: Ipv6Addr = src_addr.into();

            // The solicitation carries the sender's own mapping.
            if sender != Ipv6Addr::ANY_ADDR && iface.in_subnet_v6(&sender) {
                if let Some(mac) = lladdr.as_ref().and_then(lladdr_to_mac) {
                    cache.observe(
                        sender,
                        mac,
                        ObserveSource::Unsolicited,
                        now,
                        net,
                        iface_id,
                    );
                }
            }

            let v6 = iface.v6.as_ref()?;
            if target != v6.addr && target != v6.ll_addr {
                return None;
            }

            if sender == Ipv6Addr::ANY_ADDR {
                // Duplicate address detection probe: answer the
                // all-nodes group, unsolicited.
                return Some(gen_neigh_adv(
                    iface,
                    target,
                    Ipv6Addr::ALL_NODES,
                    Ipv6Addr::ALL_NODES.unchecked_multicast_mac(),
                    false,
                ));
            }

            let dst_mac = lladdr
                .as_ref()
                .and_then(lladdr_to_mac)
                .unwrap_or_else(|| frame.src_addr().into());
            Some(gen_neigh_adv(iface, target, sender, dst_mac, true))
        }

        NdiscRepr::NeighborAdvert { flags, target_addr, lladdr } => {
            let target: Ipv6Addr = target_addr.into();
            let mac = lladdr
                .as_ref()
                .and_then(lladdr_to_mac)
                .unwrap_or_else(|| frame.src_addr().into());
            let source = if flags.contains(NdiscNeighborFlags::SOLICITED) {
                ObserveSource::Solicited
            } else {
                ObserveSource::Unsolicited
            };
            if iface.in_subnet_v6(&target) {
                cache.observe(target, mac, source, now, net, iface_id);
            }
            None
        }

        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::lls::Hold;
    use crate::engine::lls::HoldAction;
    use crate::engine::lls::LlsReply;
    use crate::net::Ipv6IfaceCfg;
    use crate::time::Clocks;
    use std::sync::Arc;
    use std::sync::Mutex;

    const OUR_MAC: [u8; 6] = [0xA8, 0x40, 0x25, 0, 0, 1];
    const NEIGH_MAC: [u8; 6] = [2, 0, 0, 0, 0, 0x42];

    fn net() -> NetConfig {
        let mac = MacAddr::from(OUR_MAC);
        NetConfig {
            front: Iface::new(
                "front",
                0,
                mac,
                1,
                1,
                None,
                Some(Ipv6IfaceCfg::new(
                    "2001:db8::1".parse().unwrap(),
                    64,
                    &mac,
                )),
            ),
            back: None,
        }
    }

    fn cache() -> LinkCache<NdiscFamily> {
        LinkCache::new(Clocks::from_hz(1_000_000_000))
    }

    fn neigh_ip() -> Ipv6Addr {
        "2001:db8::42".parse().unwrap()
    }

    fn ns_from_neighbor(target: &Ipv6Addr) -> PktBuf {
        let icmp = Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit {
            target_addr: (*target).into(),
            lladdr: Some(RawHardwareAddress::from_bytes(&NEIGH_MAC)),
        });
        let sn = target.solicited_node_multicast();
        gen_nd_frame(
            MacAddr::from(NEIGH_MAC),
            sn.unchecked_multicast_mac(),
            neigh_ip(),
            sn,
            &icmp,
        )
    }

    fn na_from_neighbor(target: Ipv6Addr, solicited: bool) -> PktBuf {
        let mut flags = NdiscNeighborFlags::OVERRIDE;
        if solicited {
            flags |= NdiscNeighborFlags::SOLICITED;
        }
        let icmp = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
            flags,
            target_addr: target.into(),
            lladdr: Some(RawHardwareAddress::from_bytes(&NEIGH_MAC)),
        });
        gen_nd_frame(
            MacAddr::from(NEIGH_MAC),
            MacAddr::from(OUR_MAC),
            target,
            "2001:db8::1".parse().unwrap(),
            &icmp,
        )
    }

    #[test]
    fn solicitation_for_us_yields_advertisement() {
        let net = net();
        let mut cache = cache();
        let target: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let pkt = ns_from_neighbor(&target);

        let reply =
            process_nd(&mut cache, &net, IfaceId::Front, &pkt, 0).unwrap();

        let frame = EthernetFrame::new_checked(reply.bytes()).unwrap();
        assert_eq!(frame.dst_addr().0, NEIGH_MAC);
        assert_eq!(frame.src_addr().0, OUR_MAC);
        let ip = Ipv6Packet::new_checked(frame.payload()).unwrap();
        assert_eq!(ip.hop_limit(), ND_HOP_LIMIT);
        assert_eq!(Ipv6Addr::from(ip.src_addr()), target);
        assert_eq!(Ipv6Addr::from(ip.dst_addr()), neigh_ip());

        let icmp = Icmpv6Packet::new_checked(ip.payload()).unwrap();
        let repr = Icmpv6Repr::parse(
            &IpAddress::Ipv6(ip.src_addr()),
            &IpAddress::Ipv6(ip.dst_addr()),
            &icmp,
            &ChecksumCapabilities::default(),
        )
        .unwrap();
        match repr {
            Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
                flags,
                target_addr,
                lladdr,
            }) => {
                assert!(flags.contains(NdiscNeighborFlags::SOLICITED));
                assert!(flags.contains(NdiscNeighborFlags::OVERRIDE));
                assert_eq!(Ipv6Addr::from(target_addr), target);
                assert_eq!(
                    lladdr_to_mac(&lladdr.unwrap()).unwrap(),
                    MacAddr::from(OUR_MAC),
                );
            }
            other => panic!("expected neighbor advert, got {other:?}"),
        }

        // The solicitation taught us the sender's mapping.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn solicitation_for_link_local_answered() {
        let net = net();
        let mut cache = cache();
        let ll = net.front.v6.as_ref().unwrap().ll_addr;
        let pkt = ns_from_neighbor(&ll);
        assert!(process_nd(&mut cache, &net, IfaceId::Front, &pkt, 0)
            .is_some());
    }

    #[test]
    fn solicitation_for_other_target_ignored() {
        let net = net();
        let mut cache = cache();
        let pkt = ns_from_neighbor(&"2001:db8::77".parse().unwrap());
        assert!(process_nd(&mut cache, &net, IfaceId::Front, &pkt, 0)
            .is_none());
        // Sender mapping still learned.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn advertisement_resolves_hold() {
        let net = net();
        let mut cache = cache();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_cb = Arc::clone(&log);
        let hold = Hold {
            worker_id: 1,
            cb: Box::new(move |reply| {
                if let LlsReply::Resolved(map) = reply {
                    log_cb.lock().unwrap().push((map.mac, map.stale));
                }
                HoldAction::CallAgain
            }),
        };
        let _ = cache.hold(neigh_ip(), hold, 0, &net);

        let pkt = na_from_neighbor(neigh_ip(), true);
        assert!(process_nd(&mut cache, &net, IfaceId::Front, &pkt, 5)
            .is_none());
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[(MacAddr::from(NEIGH_MAC), false)],
        );
    }

    #[test]
    fn solicit_frame_shapes() {
        let net = net();
        let target = neigh_ip();

        // Multicast solicitation to the target's solicited-node group.
        let frame = NdiscFamily::solicit_frame(&net.front, &target, None);
        let eth = EthernetFrame::new_checked(frame.bytes()).unwrap();
        let sn = target.solicited_node_multicast();
        assert_eq!(eth.dst_addr().0, sn.unchecked_multicast_mac().bytes());
        let ip = Ipv6Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(Ipv6Addr::from(ip.dst_addr()), sn);
        assert_eq!(
            Ipv6Addr::from(ip.src_addr()),
            "2001:db8::1".parse().unwrap(),
        );

        // Unicast refresh probe straight to the known MAC.
        let frame = NdiscFamily::solicit_frame(
            &net.front,
            &target,
            Some(MacAddr::from(NEIGH_MAC)),
        );
        let eth = EthernetFrame::new_checked(frame.bytes()).unwrap();
        assert_eq!(eth.dst_addr().0, NEIGH_MAC);
        let ip = Ipv6Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(Ipv6Addr::from(ip.dst_addr()), target);

        // Link-local targets are solicited from the link-local source.
        let ll_target: Ipv6Addr = "fe80::42".parse().unwrap();
        let frame = NdiscFamily::solicit_frame(&net.front, &ll_target, None);
        let eth = EthernetFrame::new_checked(frame.bytes()).unwrap();
        let ip = Ipv6Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(
            Ipv6Addr::from(ip.src_addr()),
            net.front.v6.as_ref().unwrap().ll_addr,
        );
    }
}
