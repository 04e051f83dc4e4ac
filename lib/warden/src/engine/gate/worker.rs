// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The admission worker: one per core, each owning a shard of the flow
//! space.
//!
//! RSS steers a flow's packets to exactly one worker's front RX queue,
//! so the worker's flow table and entry array are touched by nobody
//! else. Policy decisions reach the worker through its mailbox; the
//! feeder replays the NIC's steering ([`GateDirectory`]) so decisions
//! land on the core that owns the flow.

use super::classify;
use super::FlowEntry;
use super::FlowState;
use super::GrantedBlock;
use super::DeclinedBlock;
use super::Verdict;
use super::DropReason;
use crate::engine::encap::encapsulate;
use crate::engine::flow_table::FlowTable;
use crate::engine::lls::LlsHandle;
use crate::engine::packet;
use crate::engine::packet::PktBuf;
use crate::engine::RouteLookup;
use crate::mailbox::Mailbox;
use crate::net::IfaceId;
use crate::net::NetConfig;
use crate::net::NicPort;
use crate::net::QueueType;
use crate::net::RssConfig;
use crate::net::MAX_PKT_BURST;
use crate::net::RSS_RETA_SIZE;
use crate::time::Clocks;
use crate::ExecCtx;
use crate::RateLimited;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use warden_api::FlowKey;
use warden_api::Policy;
use warden_api::PolicyParams;
use warden_api::WardenError;

/// Commands drained from a worker's mailbox per loop iteration.
pub const GATE_CMD_BURST_SIZE: usize = 32;

/// Commands an admission worker accepts.
#[derive(Clone, Copy, Debug)]
pub enum GateCmd {
    PolicyAdd(Policy),
}

/// Queues an admission worker was assigned in stage 1: where its shard
/// of front traffic arrives, and where encapsulated packets leave.
#[derive(Clone, Copy, Debug)]
pub struct GateQueues {
    pub rx_front: u16,
    pub tx_back: u16,
}

impl GateQueues {
    /// Stage 1: claim the worker's front RX and back TX queues. A
    /// failed back claim releases the front one again before the error
    /// surfaces.
    pub fn assign(
        net: &mut NetConfig,
        worker_id: u32,
    ) -> Result<Self, WardenError> {
        let rx_front = net.front.get_queue_id(QueueType::Rx, worker_id)?;

        let err = match net.back.as_mut() {
            Some(back) => {
                match back.get_queue_id(QueueType::Tx, worker_id) {
                    Ok(tx_back) => return Ok(Self { rx_front, tx_back }),
                    Err(err) => err,
                }
            }
            None => WardenError::BadState(
                "admission workers require a back interface".into(),
            ),
        };
        net.front.put_queue_id(QueueType::Rx, worker_id);
        Err(err)
    }
}

/// Stage 2: program front RSS over the admission workers' RX queues
/// and read back the configuration the NIC settled on. On failure
/// nothing stays programmed, half-applied state included.
pub fn setup_front_rss<P: NicPort>(
    front: &P,
    rx_queues: &[u16],
) -> Result<RssConfig, WardenError> {
    if let Err(err) = front.setup_rss(rx_queues) {
        let _ = front.clear_rss();
        return Err(err);
    }
    Ok(front.rss_config())
}

/// Per-worker counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct GateStats {
    pub rx: u64,
    pub tx: u64,
    pub parse_drops: u64,
    pub nd_handoff: u64,
    pub nd_handoff_drops: u64,
    pub table_full_drops: u64,
    pub budget_drops: u64,
    pub declined_drops: u64,
    pub bad_state_drops: u64,
    pub encap_drops: u64,
    pub tx_fail: u64,
    pub policies: u64,
    pub policy_drops: u64,
    pub clock_anomalies: u64,
}

pub struct GateWorker<P: NicPort> {
    worker_id: u32,
    net: Arc<NetConfig>,
    front: Arc<P>,
    back: Arc<P>,
    queues: GateQueues,
    table: FlowTable,
    entries: Vec<Option<FlowEntry>>,
    mailbox: Arc<Mailbox<GateCmd>>,
    rss: RssConfig,
    route: Arc<dyn RouteLookup>,
    lls: LlsHandle,
    clocks: Clocks,
    exiting: Arc<AtomicBool>,
    ectx: Arc<ExecCtx>,
    stats: GateStats,
    drop_log: RateLimited,
}

impl<P: NicPort> GateWorker<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: u32,
        net: Arc<NetConfig>,
        front: Arc<P>,
        back: Arc<P>,
        queues: GateQueues,
        flow_table_capacity: usize,
        rss: RssConfig,
        route: Arc<dyn RouteLookup>,
        lls: LlsHandle,
        clocks: Clocks,
        exiting: Arc<AtomicBool>,
        ectx: Arc<ExecCtx>,
    ) -> Self {
        let table = FlowTable::new(
            &format!("ip_flow_hash_{worker_id}"),
            flow_table_capacity,
        );
        Self {
            worker_id,
            net,
            front,
            back,
            queues,
            table,
            entries: {
                let mut v = Vec::new();
                v.resize_with(flow_table_capacity, || None);
                v
            },
            mailbox: Arc::new(Mailbox::new(
                crate::mailbox::MAILBOX_MAX_ENTRIES,
            )),
            rss,
            route,
            lls,
            clocks,
            exiting,
            ectx,
            stats: GateStats::default(),
            drop_log: RateLimited::new(1024),
        }
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    pub fn rx_queue_front(&self) -> u16 {
        self.queues.rx_front
    }

    pub fn tx_queue_back(&self) -> u16 {
        self.queues.tx_back
    }

    pub fn mailbox(&self) -> Arc<Mailbox<GateCmd>> {
        Arc::clone(&self.mailbox)
    }

    /// Peek at a flow's entry, by key.
    pub fn flow_entry(&self, flow: &FlowKey) -> Option<&FlowEntry> {
        let hash = self.rss.hash_flow(flow);
        let idx = self.table.lookup(flow, hash)?;
        self.entries[idx].as_ref()
    }

    pub fn run(&mut self) {
        self.ectx.note(&format!(
            "gk: worker {} running, {} flow slots",
            self.worker_id,
            self.table.capacity(),
        ));

        while !self.exiting.load(Ordering::Relaxed) {
            let now = self.clocks.now();
            self.process_iteration(now);
        }

        self.ectx
            .note(&format!("gk: worker {} exiting", self.worker_id));
    }

    /// One trip around the loop at time `now`: a burst of packets, a
    /// burst of transmits, a burst of commands.
    pub fn process_iteration(&mut self, now: u64) {
        let pkts =
            self.front.rx_burst(self.queues.rx_front, MAX_PKT_BURST);

        let mut tx = Vec::with_capacity(pkts.len());
        for pkt in pkts {
            self.stats.rx += 1;
            if let Some(out) = self.process_packet(pkt, now) {
                tx.push(out);
            }
        }

        if !tx.is_empty() {
            let requested = tx.len();
            let rejected = self.back.tx_burst(self.queues.tx_back, tx);
            self.stats.tx += (requested - rejected.len()) as u64;
            if !rejected.is_empty() {
                // Rejected frames are ours to free; dropping the
                // vector does it.
                self.stats.tx_fail += rejected.len() as u64;
                if self.drop_log.admit() {
                    self.ectx.warn(&format!(
                        "gk: back transmit queue rejected {} of {} frames",
                        rejected.len(),
                        requested,
                    ));
                }
            }
        }

        self.process_cmds(now);
    }

    fn process_packet(&mut self, pkt: PktBuf, now: u64) -> Option<PktBuf> {
        let view = match packet::extract(&pkt) {
            Ok(view) => view,
            Err(err) => {
                self.stats.parse_drops += 1;
                if self.drop_log.admit() {
                    self.ectx.warn(&format!("gk: dropping frame: {err}"));
                }
                return None;
            }
        };

        if packet::is_neighbor_discovery(&view, &pkt, &self.net.front) {
            match self.lls.submit_nd(pkt, IfaceId::Front) {
                Ok(()) => self.stats.nd_handoff += 1,
                Err(_) => self.stats.nd_handoff_drops += 1,
            }
            return None;
        }

        let hash = self.rss.hash_flow(&view.flow);
        let idx = match self.table.lookup(&view.flow, hash) {
            Some(idx) => idx,
            None => match self.table.insert(view.flow, hash) {
                Ok(idx) => {
                    let mut fe = FlowEntry::new(view.flow, now);
                    fe.grantor_id =
                        self.route.route(&view.flow.dst()).grantor_id;
                    self.entries[idx] = Some(fe);
                    idx
                }
                Err(_) => {
                    self.stats.table_full_drops += 1;
                    if self.drop_log.admit() {
                        self.ectx.warn(
                            "gk: failed to add new key to hash table",
                        );
                    }
                    return None;
                }
            },
        };

        let Some(fe) = self.entries[idx].as_mut() else {
            self.stats.bad_state_drops += 1;
            self.ectx.error(&format!(
                "gk: flow table slot {idx} has no backing entry",
            ));
            return None;
        };

        let outcome = classify(fe, pkt.len(), now, &self.clocks);
        if outcome.clock_went_backwards {
            self.stats.clock_anomalies += 1;
            if self.drop_log.admit() {
                self.ectx.error(
                    "gk: the present time smaller than the past time",
                );
            }
        }

        match outcome.verdict {
            Verdict::Forward { dscp } => {
                let route = self.route.route(&view.flow.dst());
                let mut pkt = pkt;
                match encapsulate(&mut pkt, dscp, &route.tunnel) {
                    Ok(()) => Some(pkt),
                    Err(err) => {
                        self.stats.encap_drops += 1;
                        if self.drop_log.admit() {
                            self.ectx
                                .warn(&format!("gk: encap failed: {err}"));
                        }
                        None
                    }
                }
            }
            Verdict::Drop(DropReason::Budget) => {
                self.stats.budget_drops += 1;
                None
            }
            Verdict::Drop(DropReason::Declined) => {
                self.stats.declined_drops += 1;
                None
            }
        }
    }

    fn process_cmds(&mut self, now: u64) {
        let mut cmds = Vec::new();
        self.mailbox.dequeue_burst(&mut cmds, GATE_CMD_BURST_SIZE);
        for cmd in cmds {
            match cmd {
                GateCmd::PolicyAdd(policy) => self.add_policy(policy, now),
            }
        }
    }

    /// Apply a policy decision, creating the flow entry if the
    /// decision outran the flow's first packet.
    pub fn add_policy(&mut self, policy: Policy, now: u64) {
        self.stats.policies += 1;

        let hash = self.rss.hash_flow(&policy.flow);
        let idx = match self.table.lookup(&policy.flow, hash) {
            Some(idx) => idx,
            None => match self.table.insert(policy.flow, hash) {
                Ok(idx) => {
                    let mut fe = FlowEntry::new(policy.flow, now);
                    fe.grantor_id =
                        self.route.route(&policy.flow.dst()).grantor_id;
                    self.entries[idx] = Some(fe);
                    idx
                }
                Err(_) => {
                    self.stats.policy_drops += 1;
                    self.ectx.error(
                        "gk: failed to add new key to hash table",
                    );
                    return;
                }
            },
        };

        let Some(fe) = self.entries[idx].as_mut() else {
            self.stats.bad_state_drops += 1;
            self.ectx.error(&format!(
                "gk: flow table slot {idx} has no backing entry",
            ));
            return;
        };

        match policy.params {
            PolicyParams::Granted(p) => {
                let tx_rate_kb_cycle = u64::from(p.tx_rate_kb_sec);
                fe.state = FlowState::Granted(GrantedBlock {
                    cap_expire_at: now
                        + self.clocks.from_secs(u64::from(p.cap_expire_sec)),
                    budget_renew_at: now + self.clocks.from_secs(1),
                    tx_rate_kb_cycle,
                    budget_byte: tx_rate_kb_cycle * 1024,
                    send_next_renewal_at: now
                        + self
                            .clocks
                            .from_millis(u64::from(p.next_renewal_ms)),
                    renewal_step_cycle: self
                        .clocks
                        .from_millis(u64::from(p.renewal_step_ms)),
                });
            }
            PolicyParams::Declined(p) => {
                fe.state = FlowState::Declined(DeclinedBlock {
                    expire_at: now
                        + self.clocks.from_secs(u64::from(p.expire_sec)),
                });
            }
        }
    }
}

/// The map from flow to responsible worker mailbox, used by whoever
/// feeds policies. It replays the NIC's own steering: hash the flow,
/// reduce it onto the redirection table, find the worker on that RX
/// queue.
pub struct GateDirectory {
    rss: RssConfig,
    members: Vec<(u16, Arc<Mailbox<GateCmd>>)>,
}

impl GateDirectory {
    pub fn new(
        rss: RssConfig,
        members: Vec<(u16, Arc<Mailbox<GateCmd>>)>,
    ) -> Self {
        Self { rss, members }
    }

    /// The mailbox of the worker owning `flow`, or `None` if the RSS
    /// configuration and the worker set disagree.
    pub fn responsible_mailbox(
        &self,
        flow: &FlowKey,
    ) -> Option<&Arc<Mailbox<GateCmd>>> {
        let hash = self.rss.hash_flow(flow);
        let queue = self.rss.reta[hash as usize % RSS_RETA_SIZE];
        self.members
            .iter()
            .find(|(q, _)| *q == queue)
            .map(|(_, mb)| mb)
    }
}
