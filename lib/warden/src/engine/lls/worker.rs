// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The link-layer support worker: one single-threaded,
//! run-to-completion loop owning both resolution caches.

use super::arp::process_arp;
use super::arp::ArpFamily;
use super::cache::HoldOutcome;
use super::cache::LinkCache;
use super::ndisc::process_nd;
use super::ndisc::NdiscFamily;
use super::Hold;
use super::LlsReply;
use super::LlsRequest;
use crate::engine::packet;
use crate::engine::packet::PktBuf;
use crate::mailbox::Mailbox;
use crate::net::Iface;
use crate::net::IfaceId;
use crate::net::NetConfig;
use crate::net::NicPort;
use crate::net::QueueType;
use crate::net::ETHERTYPE_ARP;
use crate::net::MAX_PKT_BURST;
use crate::time::Clocks;
use crate::ExecCtx;
use crate::RateLimited;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use warden_api::MacAddr;
use warden_api::WardenError;

/// Seconds between aging scans of each cache.
pub const LLS_CACHE_SCAN_INTERVAL_SECS: u64 = 10;

/// Queues the LLS worker was assigned in stage 1.
#[derive(Clone, Copy, Debug)]
pub struct LlsQueues {
    pub rx_front: u16,
    pub tx_front: u16,
    pub rx_back: Option<u16>,
    pub tx_back: Option<u16>,
}

impl LlsQueues {
    /// Stage 1: claim one RX and one TX queue on each interface. A
    /// failed claim releases the earlier ones in reverse order before
    /// the error surfaces.
    pub fn assign(
        net: &mut NetConfig,
        worker_id: u32,
    ) -> Result<Self, WardenError> {
        let rx_front = net.front.get_queue_id(QueueType::Rx, worker_id)?;
        let tx_front = match net.front.get_queue_id(QueueType::Tx, worker_id)
        {
            Ok(q) => q,
            Err(err) => {
                net.front.put_queue_id(QueueType::Rx, worker_id);
                return Err(err);
            }
        };

        let (rx_back, tx_back) = match net.back.as_mut() {
            Some(back) => match Self::assign_back(back, worker_id) {
                Ok((rx, tx)) => (Some(rx), Some(tx)),
                Err(err) => {
                    net.front.put_queue_id(QueueType::Tx, worker_id);
                    net.front.put_queue_id(QueueType::Rx, worker_id);
                    return Err(err);
                }
            },
            None => (None, None),
        };

        Ok(Self { rx_front, tx_front, rx_back, tx_back })
    }

    fn assign_back(
        back: &mut Iface,
        worker_id: u32,
    ) -> Result<(u16, u16), WardenError> {
        let rx = back.get_queue_id(QueueType::Rx, worker_id)?;
        match back.get_queue_id(QueueType::Tx, worker_id) {
            Ok(tx) => Ok((rx, tx)),
            Err(err) => {
                back.put_queue_id(QueueType::Rx, worker_id);
                Err(err)
            }
        }
    }
}

/// Counters of the LLS worker, single-writer like everything else it
/// owns.
#[derive(Clone, Copy, Debug, Default)]
pub struct LlsStats {
    pub rx: u64,
    pub bad_dst_mac: u64,
    pub unexpected_ethertype: u64,
    pub replies_tx: u64,
    pub solicits_tx: u64,
    pub tx_fail: u64,
    pub requests: u64,
    pub cache_full: u64,
    pub scans: u64,
}

pub struct LlsWorker<P: NicPort> {
    worker_id: u32,
    net: Arc<NetConfig>,
    front: Arc<P>,
    back: Option<Arc<P>>,
    queues: LlsQueues,
    requests: Arc<Mailbox<LlsRequest>>,
    arp: Option<LinkCache<ArpFamily>>,
    nd: Option<LinkCache<NdiscFamily>>,
    clocks: Clocks,
    next_scan_at: u64,
    debug: bool,
    exiting: Arc<AtomicBool>,
    ectx: Arc<ExecCtx>,
    stats: LlsStats,
    drop_log: RateLimited,
}

impl<P: NicPort> LlsWorker<P> {
    /// Stage 2 construction: program the EtherType filter for ARP and
    /// RSS for back-interface ND, then stand up the caches for the
    /// enabled families. When a step fails, the filters already
    /// installed are removed again in reverse order before the error
    /// surfaces.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: u32,
        net: Arc<NetConfig>,
        front: Arc<P>,
        back: Option<Arc<P>>,
        queues: LlsQueues,
        requests: Arc<Mailbox<LlsRequest>>,
        clocks: Clocks,
        debug: bool,
        exiting: Arc<AtomicBool>,
        ectx: Arc<ExecCtx>,
    ) -> Result<Self, WardenError> {
        assert_eq!(net.back_iface_enabled(), back.is_some());

        let front_filter = net.front.ipv4_enabled();
        if front_filter {
            front.ethertype_filter_add(ETHERTYPE_ARP, queues.rx_front)?;
        }
        if let (Some(back_iface), Some(back_port), Some(rx_back)) =
            (&net.back, &back, queues.rx_back)
        {
            let back_filter = back_iface.ipv4_enabled();
            if back_filter {
                if let Err(err) =
                    back_port.ethertype_filter_add(ETHERTYPE_ARP, rx_back)
                {
                    // Removal is best effort: the stage is already
                    // failing and the first error is the one reported.
                    if front_filter {
                        let _ = front.ethertype_filter_del(
                            ETHERTYPE_ARP,
                            queues.rx_front,
                        );
                    }
                    return Err(err);
                }
            }
            // ND reaches the back queue through RSS steering; there is
            // only the LLS queue to spread over.
            if back_iface.ipv6_enabled() {
                if let Err(err) = back_port.setup_rss(&[rx_back]) {
                    let _ = back_port.clear_rss();
                    if back_filter {
                        let _ = back_port
                            .ethertype_filter_del(ETHERTYPE_ARP, rx_back);
                    }
                    if front_filter {
                        let _ = front.ethertype_filter_del(
                            ETHERTYPE_ARP,
                            queues.rx_front,
                        );
                    }
                    return Err(err);
                }
            }
        }

        let arp = net.arp_enabled().then(|| LinkCache::new(clocks));
        let nd = net.nd_enabled().then(|| LinkCache::new(clocks));

        Ok(Self {
            worker_id,
            net,
            front,
            back,
            queues,
            requests,
            arp,
            nd,
            clocks,
            next_scan_at: 0,
            debug,
            exiting,
            ectx,
            stats: LlsStats::default(),
            drop_log: RateLimited::new(1024),
        })
    }

    pub fn stats(&self) -> LlsStats {
        self.stats
    }

    pub fn requests_mailbox(&self) -> Arc<Mailbox<LlsRequest>> {
        Arc::clone(&self.requests)
    }

    /// The worker loop: packets on both interfaces, then requests,
    /// then (on idle iterations) the scan deadline.
    pub fn run(&mut self) {
        self.ectx.note(&format!(
            "lls: worker {} running on front '{}'",
            self.worker_id, self.net.front.name,
        ));

        while !self.exiting.load(Ordering::Relaxed) {
            let now = self.clocks.now();
            self.process_iteration(now);
        }

        self.ectx
            .note(&format!("lls: worker {} exiting", self.worker_id));
        self.teardown();
    }

    /// One trip around the loop at time `now`.
    pub fn process_iteration(&mut self, now: u64) {
        self.process_pkts(IfaceId::Front, now);
        if self.net.back_iface_enabled() {
            self.process_pkts(IfaceId::Back, now);
        }

        // Only an idle iteration pays for the deadline check.
        if self.process_requests(now) == 0 && now >= self.next_scan_at {
            self.scan(now);
        }
    }

    /// Destroy the caches, cancelling every outstanding hold.
    pub fn teardown(&mut self) {
        if let Some(arp) = self.arp.as_mut() {
            arp.destroy();
        }
        if let Some(nd) = self.nd.as_mut() {
            nd.destroy();
        }
    }

    fn port(&self, iface: IfaceId) -> &Arc<P> {
        match iface {
            IfaceId::Front => &self.front,
            IfaceId::Back => self.back.as_ref().unwrap_or(&self.front),
        }
    }

    fn tx_queue(&self, iface: IfaceId) -> u16 {
        match iface {
            IfaceId::Front => self.queues.tx_front,
            IfaceId::Back => {
                self.queues.tx_back.unwrap_or(self.queues.tx_front)
            }
        }
    }

    fn tx_one(&mut self, iface: IfaceId, pkt: PktBuf) {
        let queue = self.tx_queue(iface);
        let rejected = self.port(iface).tx_burst(queue, vec![pkt]);
        if !rejected.is_empty() {
            self.stats.tx_fail += 1;
            if self.drop_log.admit() {
                self.ectx.warn("lls: transmit queue rejected a frame");
            }
        }
    }

    fn process_pkts(&mut self, iface_id: IfaceId, now: u64) {
        let rx_queue = match iface_id {
            IfaceId::Front => self.queues.rx_front,
            IfaceId::Back => match self.queues.rx_back {
                Some(q) => q,
                None => return,
            },
        };

        let pkts = self.port(iface_id).rx_burst(rx_queue, MAX_PKT_BURST);
        for pkt in pkts {
            self.stats.rx += 1;
            self.process_one(iface_id, pkt, now);
        }
    }

    fn process_one(&mut self, iface_id: IfaceId, pkt: PktBuf, now: u64) {
        let net = Arc::clone(&self.net);
        let Some(iface) = net.iface(iface_id) else {
            return;
        };

        let (dst_mac, ethertype) =
            match EthernetFrame::new_checked(pkt.bytes()) {
                Ok(frame) => {
                    (MacAddr::from(frame.dst_addr()), frame.ethertype())
                }
                Err(_) => return,
            };

        // Bonded slaves assume the bond's address; accept only frames
        // addressed to this interface, broadcast, or the ND multicast
        // groups.
        if !iface.accepts_dst_mac(&dst_mac) {
            self.stats.bad_dst_mac += 1;
            return;
        }

        match ethertype {
            EthernetProtocol::Arp => {
                if let Some(cache) = self.arp.as_mut() {
                    if let Some(reply) =
                        process_arp(cache, &net, iface_id, &pkt, now)
                    {
                        self.stats.replies_tx += 1;
                        self.tx_one(iface_id, reply);
                    }
                }
            }
            EthernetProtocol::Ipv6 => {
                // On the back interface RSS steers ND straight here;
                // on the front it arrives via mailbox handoff, but a
                // neighbor message landing on this queue is still
                // answered.
                let is_nd = packet::extract(&pkt)
                    .map(|view| {
                        packet::is_neighbor_discovery(&view, &pkt, iface)
                    })
                    .unwrap_or(false);
                if is_nd {
                    self.handle_nd(iface_id, &pkt, now);
                } else {
                    self.unexpected_frame(iface_id, ethertype);
                }
            }
            other => self.unexpected_frame(iface_id, other),
        }
    }

    fn unexpected_frame(&mut self, iface_id: IfaceId, ty: EthernetProtocol) {
        self.stats.unexpected_ethertype += 1;
        if self.drop_log.admit() {
            self.ectx.error(&format!(
                "lls: {:?} interface should not be seeing a packet \
                 with EtherType {ty}",
                iface_id,
            ));
        }
    }

    fn handle_nd(&mut self, iface_id: IfaceId, pkt: &PktBuf, now: u64) {
        let net = Arc::clone(&self.net);
        if let Some(cache) = self.nd.as_mut() {
            if let Some(reply) = process_nd(cache, &net, iface_id, pkt, now)
            {
                self.stats.replies_tx += 1;
                self.tx_one(iface_id, reply);
            }
        }
    }

    /// Drain a burst of requests; returns how many were handled.
    fn process_requests(&mut self, now: u64) -> usize {
        let mut cmds = Vec::new();
        let n = self.requests.dequeue_burst(&mut cmds, MAX_PKT_BURST);

        for req in cmds {
            self.stats.requests += 1;
            match req {
                LlsRequest::HoldV4 { ip, hold } => match self.arp.as_mut() {
                    Some(cache) => {
                        let net = Arc::clone(&self.net);
                        let outcome = cache.hold(ip, hold, now, &net);
                        self.finish_hold(outcome);
                    }
                    None => Self::cancel_hold(hold),
                },
                LlsRequest::PutV4 { ip, worker_id } => {
                    if let Some(cache) = self.arp.as_mut() {
                        cache.put(ip, worker_id);
                    }
                }
                LlsRequest::HoldV6 { ip, hold } => match self.nd.as_mut() {
                    Some(cache) => {
                        let net = Arc::clone(&self.net);
                        let outcome = cache.hold(ip, hold, now, &net);
                        self.finish_hold(outcome);
                    }
                    None => Self::cancel_hold(hold),
                },
                LlsRequest::PutV6 { ip, worker_id } => {
                    if let Some(cache) = self.nd.as_mut() {
                        cache.put(ip, worker_id);
                    }
                }
                LlsRequest::Nd { pkt, iface } => {
                    self.handle_nd(iface, &pkt, now);
                }
            }
        }

        n
    }

    fn finish_hold(&mut self, outcome: HoldOutcome) {
        match outcome {
            HoldOutcome::Resolved => {}
            HoldOutcome::Pending { solicit: Some((iface, frame)) } => {
                self.stats.solicits_tx += 1;
                self.tx_one(iface, frame);
            }
            HoldOutcome::Pending { solicit: None } => {}
            HoldOutcome::Full => {
                self.stats.cache_full += 1;
                self.ectx.warn("lls: cache full, hold cancelled");
            }
        }
    }

    fn cancel_hold(mut hold: Hold) {
        let _ = (hold.cb)(LlsReply::Cancelled);
    }

    fn scan(&mut self, now: u64) {
        self.stats.scans += 1;
        self.next_scan_at =
            now + self.clocks.from_secs(LLS_CACHE_SCAN_INTERVAL_SECS);
        let probe_timeout =
            self.clocks.from_secs(LLS_CACHE_SCAN_INTERVAL_SECS);

        let net = Arc::clone(&self.net);
        let mut solicits = Vec::new();
        if let Some(arp) = self.arp.as_mut() {
            solicits.extend(arp.scan(now, &net, probe_timeout));
            if self.debug {
                for line in arp.dump() {
                    self.ectx.note(&line);
                }
            }
        }
        if let Some(nd) = self.nd.as_mut() {
            solicits.extend(nd.scan(now, &net, probe_timeout));
            if self.debug {
                for line in nd.dump() {
                    self.ectx.note(&line);
                }
            }
        }

        for (iface, frame) in solicits {
            self.stats.solicits_tx += 1;
            self.tx_one(iface, frame);
        }
    }
}
