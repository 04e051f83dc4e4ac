// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The network layer the workers stand on: interface configuration,
//! queue assignment, receive-side scaling, and the poll-mode port
//! provider.
//!
//! The gateway has a *front* interface facing the Internet and an
//! optional *back* interface carrying the overlay to the grantors.
//! Each interface owns a set of RX/TX queues handed out to workers at
//! setup time; RSS spreads inbound flows across the RX queues with a
//! keyed Toeplitz hash, and because the same key is known to the
//! engine, any process can compute which worker owns a flow.

use crate::engine::packet::PktBuf;
use alloc::string::String;
use alloc::vec::Vec;
use warden_api::Ipv4Addr;
use warden_api::Ipv6Addr;
use warden_api::MacAddr;
use warden_api::WardenError;
use warden_api::FLOW_KEY_MAX_RSS_LEN;
use warden_api::FlowKey;

/// Receive and transmit burst size, everywhere.
pub const MAX_PKT_BURST: usize = 32;

/// EtherType of ARP frames, for filter programming.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Length in bytes of the RSS hash key.
pub const RSS_KEY_LEN: usize = 40;

/// Number of entries in the RSS redirection table. The policy-routing
/// computation depends on this exact size.
pub const RSS_RETA_SIZE: usize = 128;

/// The default RSS hash key: the key from the RSS verification suite,
/// which every NIC vendor tests against.
pub const DEFAULT_RSS_KEY: [u8; RSS_KEY_LEN] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d,
    0x43, 0xa3, 0x8f, 0xb0, 0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4,
    0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30, 0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b,
    0xbe, 0xac, 0x01, 0xfa,
];

/// The Toeplitz hash over `data` with `key`.
///
/// The 32-bit window starts at the top of the key and slides right one
/// bit per input bit; each set input bit XORs the current window into
/// the result. `key` must cover `data.len() + 4` bytes.
pub fn toeplitz_hash(key: &[u8], data: &[u8]) -> u32 {
    debug_assert!(key.len() >= data.len() + 4);
    let mut hash = 0u32;
    let mut window = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    let mut next = 32usize;
    for &byte in data {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                hash ^= window;
            }
            let key_bit = if next / 8 < key.len() {
                (key[next / 8] >> (7 - (next % 8))) & 1
            } else {
                0
            };
            window = (window << 1) | u32::from(key_bit);
            next += 1;
        }
    }
    hash
}

/// The RSS state of a port: the hash key it was programmed with and
/// its redirection table.
#[derive(Clone, Debug)]
pub struct RssConfig {
    pub key: [u8; RSS_KEY_LEN],
    pub reta: [u16; RSS_RETA_SIZE],
}

impl RssConfig {
    /// The configuration a port ends up with after `setup_rss`:
    /// the default key, queues striped across the redirection table.
    pub fn for_queues(queues: &[u16]) -> Self {
        assert!(!queues.is_empty());
        let mut reta = [0u16; RSS_RETA_SIZE];
        for (i, slot) in reta.iter_mut().enumerate() {
            *slot = queues[i % queues.len()];
        }
        Self { key: DEFAULT_RSS_KEY, reta }
    }

    /// The hash the NIC computes for packets of this flow.
    pub fn hash_flow(&self, flow: &FlowKey) -> u32 {
        let mut buf = [0u8; FLOW_KEY_MAX_RSS_LEN];
        let input = flow.rss_input(&mut buf);
        toeplitz_hash(&self.key, input)
    }

    /// The RX queue the redirection table steers this flow to.
    pub fn queue_for_flow(&self, flow: &FlowKey) -> u16 {
        let hash = self.hash_flow(flow);
        self.reta[hash as usize % RSS_RETA_SIZE]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueType {
    Rx,
    Tx,
}

/// Which of the gateway's two interfaces a packet or queue belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IfaceId {
    Front,
    Back,
}

/// IPv4 configuration of an interface.
#[derive(Clone, Debug)]
pub struct Ipv4IfaceCfg {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

/// IPv6 configuration of an interface, including the addresses
/// neighbor discovery answers for. The link-local address and the two
/// solicited-node multicast groups (with their Ethernet multicast
/// addresses) are derived, not configured.
#[derive(Clone, Debug)]
pub struct Ipv6IfaceCfg {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub ll_addr: Ipv6Addr,
    pub sn_mc_addr: Ipv6Addr,
    pub ll_sn_mc_addr: Ipv6Addr,
    pub mc_mac: MacAddr,
    pub ll_mc_mac: MacAddr,
}

impl Ipv6IfaceCfg {
    pub fn new(addr: Ipv6Addr, prefix_len: u8, mac: &MacAddr) -> Self {
        let ll_addr = Ipv6Addr::from_eui64(mac);
        let sn_mc_addr = addr.solicited_node_multicast();
        let ll_sn_mc_addr = ll_addr.solicited_node_multicast();
        Self {
            addr,
            prefix_len,
            ll_addr,
            sn_mc_addr,
            ll_sn_mc_addr,
            mc_mac: sn_mc_addr.unchecked_multicast_mac(),
            ll_mc_mac: ll_sn_mc_addr.unchecked_multicast_mac(),
        }
    }
}

/// A gateway interface and its queue bookkeeping.
#[derive(Debug)]
pub struct Iface {
    pub name: String,
    /// Port number on the NIC provider.
    pub port: u16,
    pub mac: MacAddr,
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
    /// Seconds before a resolution learned on this interface goes
    /// stale, per family.
    pub arp_cache_timeout_sec: u32,
    pub nd_cache_timeout_sec: u32,
    pub v4: Option<Ipv4IfaceCfg>,
    pub v6: Option<Ipv6IfaceCfg>,
    rx_assigned: Vec<(u32, u16)>,
    tx_assigned: Vec<(u32, u16)>,
}

impl Iface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        port: u16,
        mac: MacAddr,
        num_rx_queues: u16,
        num_tx_queues: u16,
        v4: Option<Ipv4IfaceCfg>,
        v6: Option<Ipv6IfaceCfg>,
    ) -> Self {
        Self {
            name: String::from(name),
            port,
            mac,
            num_rx_queues,
            num_tx_queues,
            arp_cache_timeout_sec: 7200,
            nd_cache_timeout_sec: 7200,
            v4,
            v6,
            rx_assigned: Vec::new(),
            tx_assigned: Vec::new(),
        }
    }

    pub fn ipv4_enabled(&self) -> bool {
        self.v4.is_some()
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.v6.is_some()
    }

    /// Assign (or return the already assigned) queue of the given type
    /// for a worker. Assignment happens in the single-threaded setup
    /// stages, one worker at a time.
    pub fn get_queue_id(
        &mut self,
        ty: QueueType,
        worker: u32,
    ) -> Result<u16, WardenError> {
        let (assigned, limit) = match ty {
            QueueType::Rx => (&mut self.rx_assigned, self.num_rx_queues),
            QueueType::Tx => (&mut self.tx_assigned, self.num_tx_queues),
        };

        if let Some((_, q)) = assigned.iter().find(|(w, _)| *w == worker) {
            return Ok(*q);
        }

        let next = assigned.len() as u16;
        if next >= limit {
            return Err(WardenError::QueueExhausted {
                iface: self.name.clone(),
                requested: u64::from(next) + 1,
            });
        }
        assigned.push((worker, next));
        Ok(next)
    }

    /// Release a worker's queue claim. Claims are released in reverse
    /// assignment order when a setup stage unwinds, so only the most
    /// recent claim is taken back; anything else is a no-op.
    pub fn put_queue_id(&mut self, ty: QueueType, worker: u32) {
        let assigned = match ty {
            QueueType::Rx => &mut self.rx_assigned,
            QueueType::Tx => &mut self.tx_assigned,
        };
        if assigned.last().is_some_and(|(w, _)| *w == worker) {
            assigned.pop();
        }
    }

    /// Every RX queue assigned so far, in assignment order.
    pub fn rx_queues(&self) -> Vec<u16> {
        self.rx_assigned.iter().map(|(_, q)| *q).collect()
    }

    /// Should a frame with this destination MAC be looked at? The
    /// accepted set is the broadcast address, the interface address,
    /// and the two derived IPv6 multicast addresses.
    pub fn accepts_dst_mac(&self, dst: &MacAddr) -> bool {
        if dst.is_broadcast() || *dst == self.mac {
            return true;
        }
        match &self.v6 {
            Some(v6) => *dst == v6.mc_mac || *dst == v6.ll_mc_mac,
            None => false,
        }
    }

    /// Is `dst` one of the IPv6 addresses neighbor discovery speaks
    /// for on this interface: the global or link-local unicast, or
    /// either solicited-node multicast group?
    pub fn is_nd_target(&self, dst: &Ipv6Addr) -> bool {
        match &self.v6 {
            Some(v6) => {
                *dst == v6.addr
                    || *dst == v6.ll_addr
                    || *dst == v6.sn_mc_addr
                    || *dst == v6.ll_sn_mc_addr
            }
            None => false,
        }
    }

    /// Is the address on this interface's IPv4 subnet?
    pub fn in_subnet_v4(&self, addr: &Ipv4Addr) -> bool {
        match &self.v4 {
            Some(v4) => {
                addr.mask(v4.prefix_len)
                    == v4.addr.mask(v4.prefix_len)
            }
            None => false,
        }
    }

    /// Is the address on this interface's IPv6 subnet (global prefix
    /// or link-local)?
    pub fn in_subnet_v6(&self, addr: &Ipv6Addr) -> bool {
        match &self.v6 {
            Some(v6) => {
                addr.is_link_local()
                    || addr.mask(v6.prefix_len)
                        == v6.addr.mask(v6.prefix_len)
            }
            None => false,
        }
    }
}

/// The two interfaces of the gateway. A back interface is absent when
/// the process runs colocated with a grantor.
#[derive(Debug)]
pub struct NetConfig {
    pub front: Iface,
    pub back: Option<Iface>,
}

impl NetConfig {
    pub fn back_iface_enabled(&self) -> bool {
        self.back.is_some()
    }

    pub fn iface(&self, id: IfaceId) -> Option<&Iface> {
        match id {
            IfaceId::Front => Some(&self.front),
            IfaceId::Back => self.back.as_ref(),
        }
    }

    /// Is the family served on at least one interface?
    pub fn arp_enabled(&self) -> bool {
        self.front.ipv4_enabled()
            || self.back.as_ref().is_some_and(|b| b.ipv4_enabled())
    }

    pub fn nd_enabled(&self) -> bool {
        self.front.ipv6_enabled()
            || self.back.as_ref().is_some_and(|b| b.ipv6_enabled())
    }
}

/// The poll-mode NIC provider.
///
/// Distinct queues are independently usable, so the methods take
/// `&self`; exclusive use of any one queue follows from queue
/// assignment, each queue belonging to exactly one worker.
pub trait NicPort: Send + Sync {
    /// Receive up to `max` frames from `queue`. Never blocks; an empty
    /// vector means nothing was waiting.
    fn rx_burst(&self, queue: u16, max: usize) -> Vec<PktBuf>;

    /// Transmit a burst on `queue`, returning the frames the queue
    /// rejected. The caller owns (and typically frees) the returned
    /// frames.
    #[must_use = "rejected frames must be accounted for"]
    fn tx_burst(&self, queue: u16, pkts: Vec<PktBuf>) -> Vec<PktBuf>;

    /// Steer frames of `ethertype` to `queue`.
    fn ethertype_filter_add(
        &self,
        ethertype: u16,
        queue: u16,
    ) -> Result<(), WardenError>;

    /// Remove a filter previously installed with
    /// [`NicPort::ethertype_filter_add`]. Setup stages call this when
    /// a later step fails and the stage unwinds.
    fn ethertype_filter_del(
        &self,
        ethertype: u16,
        queue: u16,
    ) -> Result<(), WardenError>;

    /// Program RSS over `queues` with the default key.
    fn setup_rss(&self, queues: &[u16]) -> Result<(), WardenError>;

    /// Return RSS to its unprogrammed state, discarding anything a
    /// failed `setup_rss` may have half-applied.
    fn clear_rss(&self) -> Result<(), WardenError>;

    /// The RSS state the port is running with.
    fn rss_config(&self) -> RssConfig;
}

cfg_if! {
    if #[cfg(any(feature = "std", test))] {
        pub mod testing {
            //! An in-memory [`NicPort`]: per-queue rings fed and
            //! drained by tests (or embeddings without hardware).

            use super::NicPort;
            use super::RssConfig;
            use crate::engine::packet::PktBuf;
            use std::collections::BTreeMap;
            use std::collections::VecDeque;
            use std::sync::Mutex;
            use warden_api::WardenError;

            #[derive(Default)]
            pub struct MemPort {
                rx: Mutex<BTreeMap<u16, VecDeque<PktBuf>>>,
                tx: Mutex<BTreeMap<u16, Vec<PktBuf>>>,
                /// Queues refusing further frames, for tx-failure
                /// testing.
                tx_blocked: Mutex<Vec<u16>>,
                filters: Mutex<Vec<(u16, u16)>>,
                rss: Mutex<Option<RssConfig>>,
                /// When set, the next `setup_rss` fails (and clears
                /// the flag), for construction-failure testing.
                fail_rss: Mutex<bool>,
            }

            impl MemPort {
                pub fn new() -> Self {
                    Self::default()
                }

                /// Make the next `setup_rss` call fail.
                pub fn fail_next_setup_rss(&self) {
                    *self.fail_rss.lock().unwrap() = true;
                }

                /// Has `setup_rss` been applied (and not cleared)?
                pub fn rss_programmed(&self) -> bool {
                    self.rss.lock().unwrap().is_some()
                }

                /// Queue a frame for the next `rx_burst` on `queue`.
                pub fn push_rx(&self, queue: u16, pkt: PktBuf) {
                    self.rx
                        .lock()
                        .unwrap()
                        .entry(queue)
                        .or_default()
                        .push_back(pkt);
                }

                /// Everything transmitted on `queue` so far.
                pub fn take_tx(&self, queue: u16) -> Vec<PktBuf> {
                    self.tx
                        .lock()
                        .unwrap()
                        .entry(queue)
                        .or_default()
                        .drain(..)
                        .collect()
                }

                pub fn block_tx(&self, queue: u16) {
                    self.tx_blocked.lock().unwrap().push(queue);
                }

                /// EtherType filters programmed on this port.
                pub fn filters(&self) -> Vec<(u16, u16)> {
                    self.filters.lock().unwrap().clone()
                }
            }

            impl NicPort for MemPort {
                fn rx_burst(&self, queue: u16, max: usize) -> Vec<PktBuf> {
                    let mut rx = self.rx.lock().unwrap();
                    let ring = rx.entry(queue).or_default();
                    let n = ring.len().min(max);
                    ring.drain(..n).collect()
                }

                fn tx_burst(
                    &self,
                    queue: u16,
                    pkts: Vec<PktBuf>,
                ) -> Vec<PktBuf> {
                    if self.tx_blocked.lock().unwrap().contains(&queue) {
                        return pkts;
                    }
                    self.tx
                        .lock()
                        .unwrap()
                        .entry(queue)
                        .or_default()
                        .extend(pkts);
                    Vec::new()
                }

                fn ethertype_filter_add(
                    &self,
                    ethertype: u16,
                    queue: u16,
                ) -> Result<(), WardenError> {
                    self.filters.lock().unwrap().push((ethertype, queue));
                    Ok(())
                }

                fn ethertype_filter_del(
                    &self,
                    ethertype: u16,
                    queue: u16,
                ) -> Result<(), WardenError> {
                    let mut filters = self.filters.lock().unwrap();
                    match filters
                        .iter()
                        .position(|f| *f == (ethertype, queue))
                    {
                        Some(i) => {
                            filters.remove(i);
                            Ok(())
                        }
                        None => Err(WardenError::BadState(format!(
                            "no filter {ethertype:#06x} on queue {queue}",
                        ))),
                    }
                }

                fn setup_rss(
                    &self,
                    queues: &[u16],
                ) -> Result<(), WardenError> {
                    let mut fail = self.fail_rss.lock().unwrap();
                    if *fail {
                        *fail = false;
                        return Err(WardenError::BadState(
                            "injected setup_rss failure".into(),
                        ));
                    }
                    *self.rss.lock().unwrap() =
                        Some(RssConfig::for_queues(queues));
                    Ok(())
                }

                fn clear_rss(&self) -> Result<(), WardenError> {
                    *self.rss.lock().unwrap() = None;
                    Ok(())
                }

                fn rss_config(&self) -> RssConfig {
                    self.rss
                        .lock()
                        .unwrap()
                        .clone()
                        .unwrap_or_else(|| RssConfig::for_queues(&[0]))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use warden_api::AddrPair;

    // Input and output rows from the canonical RSS verification
    // suite: Toeplitz over (src, dst) with the well-known key.
    #[test]
    fn toeplitz_verification_suite_v4() {
        let src: Ipv4Addr = "66.9.149.187".parse().unwrap();
        let dst: Ipv4Addr = "161.142.100.80".parse().unwrap();
        let mut input = [0u8; 8];
        input[..4].copy_from_slice(&src.bytes());
        input[4..].copy_from_slice(&dst.bytes());
        assert_eq!(toeplitz_hash(&DEFAULT_RSS_KEY, &input), 0x323e_8fc2);

        let src: Ipv4Addr = "199.92.111.2".parse().unwrap();
        let dst: Ipv4Addr = "65.69.140.83".parse().unwrap();
        let mut input = [0u8; 8];
        input[..4].copy_from_slice(&src.bytes());
        input[4..].copy_from_slice(&dst.bytes());
        assert_eq!(toeplitz_hash(&DEFAULT_RSS_KEY, &input), 0xd718_262a);
    }

    #[test]
    fn toeplitz_verification_suite_v6() {
        let src: Ipv6Addr = "3ffe:2501:200:1fff::7".parse().unwrap();
        let dst: Ipv6Addr = "3ffe:2501:200:3::1".parse().unwrap();
        let mut input = [0u8; 32];
        input[..16].copy_from_slice(&src.bytes());
        input[16..].copy_from_slice(&dst.bytes());
        assert_eq!(toeplitz_hash(&DEFAULT_RSS_KEY, &input), 0x2cc1_8cd5);
    }

    #[test]
    fn rss_config_matches_flow_hash() {
        let cfg = RssConfig::for_queues(&[0, 1, 2]);
        let flow = FlowKey {
            addrs: AddrPair::V4 {
                src: "66.9.149.187".parse().unwrap(),
                dst: "161.142.100.80".parse().unwrap(),
            },
        };
        assert_eq!(cfg.hash_flow(&flow), 0x323e_8fc2);
        let expected = cfg.reta[0x323e_8fc2usize % RSS_RETA_SIZE];
        assert_eq!(cfg.queue_for_flow(&flow), expected);
    }

    fn test_iface() -> Iface {
        let mac = MacAddr::from([0xA8, 0x40, 0x25, 0x00, 0x00, 0x63]);
        Iface::new(
            "front",
            0,
            mac,
            2,
            2,
            Some(Ipv4IfaceCfg {
                addr: "10.0.1.1".parse().unwrap(),
                prefix_len: 24,
            }),
            Some(Ipv6IfaceCfg::new(
                "2001:db8::1".parse().unwrap(),
                64,
                &mac,
            )),
        )
    }

    #[test]
    fn queue_assignment() {
        let mut iface = test_iface();
        assert_eq!(iface.get_queue_id(QueueType::Rx, 7).unwrap(), 0);
        assert_eq!(iface.get_queue_id(QueueType::Rx, 9).unwrap(), 1);
        // Same worker asks again, same queue.
        assert_eq!(iface.get_queue_id(QueueType::Rx, 7).unwrap(), 0);
        assert!(matches!(
            iface.get_queue_id(QueueType::Rx, 11),
            Err(WardenError::QueueExhausted { .. }),
        ));
        // TX space is separate.
        assert_eq!(iface.get_queue_id(QueueType::Tx, 11).unwrap(), 0);
        assert_eq!(iface.rx_queues(), vec![0, 1]);
    }

    #[test]
    fn queue_claims_release_in_reverse() {
        let mut iface = test_iface();
        assert_eq!(iface.get_queue_id(QueueType::Rx, 7).unwrap(), 0);
        assert_eq!(iface.get_queue_id(QueueType::Rx, 9).unwrap(), 1);

        // Releasing the most recent claim frees its queue for reuse.
        iface.put_queue_id(QueueType::Rx, 9);
        assert_eq!(iface.rx_queues(), vec![0]);
        assert_eq!(iface.get_queue_id(QueueType::Rx, 11).unwrap(), 1);

        // Anything but the most recent claim stays put.
        iface.put_queue_id(QueueType::Rx, 7);
        assert_eq!(iface.rx_queues(), vec![0, 1]);
    }

    #[test]
    fn nd_target_set() {
        let iface = test_iface();
        let v6 = iface.v6.as_ref().unwrap();
        assert!(iface.is_nd_target(&v6.addr));
        assert!(iface.is_nd_target(&v6.ll_addr));
        assert!(iface.is_nd_target(&v6.sn_mc_addr));
        assert!(iface.is_nd_target(&v6.ll_sn_mc_addr));
        assert!(!iface.is_nd_target(&"2001:db8::99".parse().unwrap()));
    }

    #[test]
    fn dst_mac_filter() {
        let iface = test_iface();
        assert!(iface.accepts_dst_mac(&MacAddr::BROADCAST));
        assert!(iface.accepts_dst_mac(&iface.mac));
        let v6 = iface.v6.as_ref().unwrap().clone();
        assert!(iface.accepts_dst_mac(&v6.mc_mac));
        assert!(iface.accepts_dst_mac(&v6.ll_mc_mac));
        assert!(!iface
            .accepts_dst_mac(&MacAddr::from([2, 0, 0, 0, 0, 1])));
    }

    #[test]
    fn subnets() {
        let iface = test_iface();
        assert!(iface.in_subnet_v4(&"10.0.1.200".parse().unwrap()));
        assert!(!iface.in_subnet_v4(&"10.0.2.200".parse().unwrap()));
        assert!(iface.in_subnet_v6(&"2001:db8::77".parse().unwrap()));
        assert!(iface.in_subnet_v6(&"fe80::1".parse().unwrap()));
        assert!(!iface.in_subnet_v6(&"2001:db9::77".parse().unwrap()));
    }
}
