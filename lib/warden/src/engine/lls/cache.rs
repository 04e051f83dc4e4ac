// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The resolution cache, generic over the address family.
//!
//! ARP and neighbor discovery differ in wire format and in how a
//! solicitation is addressed, but the cache underneath them is one
//! machine: records move from unresolved through resolved to stale,
//! get re-probed while somebody still holds them, and age out when
//! nobody does. [`LinkFamily`] is the capability set a family plugs
//! in; [`super::arp::ArpFamily`] and [`super::ndisc::NdiscFamily`] are
//! the two implementations.

use super::Hold;
use super::HoldAction;
use super::LinkMap;
use super::LlsReply;
use super::LLS_CACHE_RECORDS;
use crate::engine::packet::PktBuf;
use crate::net::Iface;
use crate::net::IfaceId;
use crate::net::NetConfig;
use crate::time::Clocks;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use warden_api::IpAddr;
use warden_api::MacAddr;

/// What an address family provides the cache.
pub trait LinkFamily {
    const NAME: &'static str;

    type Addr: Copy + Ord + core::fmt::Display;

    /// Does `iface` carry this family at all?
    fn iface_enabled(iface: &Iface) -> bool;

    /// Is `addr` on `iface`'s subnet for this family?
    fn in_subnet(iface: &Iface, addr: &Self::Addr) -> bool;

    /// Seconds a resolution learned via `iface` stays fresh.
    fn timeout_sec(iface: &Iface) -> u32;

    fn to_ip(addr: &Self::Addr) -> IpAddr;

    /// Build a solicitation for `addr` to transmit out `iface`.
    /// With `unicast` the probe goes straight to the previously known
    /// MAC; without, it is broadcast (ARP) or solicited-node multicast
    /// (ND).
    fn solicit_frame(
        iface: &Iface,
        addr: &Self::Addr,
        unicast: Option<MacAddr>,
    ) -> PktBuf;
}

/// Where a resolution came from. Only solicited answers confirm a
/// record fresh; unsolicited ones update it but leave it to the next
/// scan to verify.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObserveSource {
    Solicited,
    Unsolicited,
}

/// What `hold` did.
#[derive(Debug)]
pub enum HoldOutcome {
    /// Fresh resolution existed; the callback has already run.
    Resolved,
    /// The hold is parked. If a solicitation needs to go out, here it
    /// is; `None` means a probe is already in flight.
    Pending { solicit: Option<(IfaceId, PktBuf)> },
    /// The cache is at capacity; the hold was cancelled.
    Full,
}

#[derive(Debug)]
struct Record<A> {
    addr: A,
    iface: IfaceId,
    port: u16,
    mac: Option<MacAddr>,
    stale: bool,
    last_confirmed_at: u64,
    /// Set while a solicitation is outstanding.
    probe_sent_at: Option<u64>,
    ttl_cycles: u64,
    holds: Vec<Hold>,
}

impl<A: Copy> Record<A> {
    fn map(&self, to_ip: impl Fn(&A) -> IpAddr) -> Option<LinkMap> {
        self.mac.map(|mac| LinkMap {
            addr: to_ip(&self.addr),
            mac,
            port: self.port,
            stale: self.stale,
        })
    }

    fn fresh(&self, now: u64) -> bool {
        self.mac.is_some()
            && now.saturating_sub(self.last_confirmed_at) < self.ttl_cycles
    }
}

/// The per-family cache. Owned by the LLS worker; everything here runs
/// on its core, including every callback invocation.
pub struct LinkCache<F: LinkFamily> {
    clocks: Clocks,
    records: BTreeMap<F::Addr, Record<F::Addr>>,
}

impl<F: LinkFamily> LinkCache<F> {
    pub fn new(clocks: Clocks) -> Self {
        Self { clocks, records: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn pick_iface<'n>(
        net: &'n NetConfig,
        addr: &F::Addr,
    ) -> (IfaceId, &'n Iface) {
        if F::in_subnet(&net.front, addr) {
            return (IfaceId::Front, &net.front);
        }
        if let Some(back) = &net.back {
            if F::in_subnet(back, addr) {
                return (IfaceId::Back, back);
            }
        }
        // Off-subnet: fall back to whichever interface speaks the
        // family at all.
        if F::iface_enabled(&net.front) {
            return (IfaceId::Front, &net.front);
        }
        if let Some(back) = &net.back {
            if F::iface_enabled(back) {
                return (IfaceId::Back, back);
            }
        }
        (IfaceId::Front, &net.front)
    }

    /// Subscribe `hold` to `addr`'s resolution. A fresh record answers
    /// synchronously; anything else parks the hold and (if no probe is
    /// already out) asks the caller to transmit a solicitation.
    pub fn hold(
        &mut self,
        addr: F::Addr,
        mut hold: Hold,
        now: u64,
        net: &NetConfig,
    ) -> HoldOutcome {
        if let Some(rec) = self.records.get_mut(&addr) {
            // One hold per (address, worker): a duplicate replaces the
            // prior callback.
            rec.holds.retain(|h| h.worker_id != hold.worker_id);

            if rec.fresh(now) {
                let map = rec.map(F::to_ip).unwrap();
                if (hold.cb)(LlsReply::Resolved(&map)) == HoldAction::CallAgain
                {
                    rec.holds.push(hold);
                }
                return HoldOutcome::Resolved;
            }

            let solicit = if rec.probe_sent_at.is_none() {
                rec.probe_sent_at = Some(now);
                let iface = match net.iface(rec.iface) {
                    Some(iface) => iface,
                    None => &net.front,
                };
                Some((rec.iface, F::solicit_frame(iface, &addr, rec.mac)))
            } else {
                None
            };
            rec.holds.push(hold);
            return HoldOutcome::Pending { solicit };
        }

        if self.records.len() >= LLS_CACHE_RECORDS {
            let _ = (hold.cb)(LlsReply::Cancelled);
            return HoldOutcome::Full;
        }

        let (iface_id, iface) = Self::pick_iface(net, &addr);
        let frame = F::solicit_frame(iface, &addr, None);
        self.records.insert(
            addr,
            Record {
                addr,
                iface: iface_id,
                port: iface.port,
                mac: None,
                stale: false,
                last_confirmed_at: now,
                probe_sent_at: Some(now),
                ttl_cycles: self.clocks.from_secs(F::timeout_sec(iface).into()),
                holds: vec![hold],
            },
        );
        HoldOutcome::Pending { solicit: Some((iface_id, frame)) }
    }

    /// Remove `worker_id`'s hold on `addr`. The record stays for the
    /// scan to age out.
    pub fn put(&mut self, addr: F::Addr, worker_id: u32) {
        if let Some(rec) = self.records.get_mut(&addr) {
            rec.holds.retain(|h| h.worker_id != worker_id);
        }
    }

    /// Merge a resolution seen on `iface`. New or changed MACs wake
    /// every hold; a solicited answer additionally confirms the record
    /// fresh and retires any outstanding probe.
    pub fn observe(
        &mut self,
        addr: F::Addr,
        mac: MacAddr,
        source: ObserveSource,
        now: u64,
        net: &NetConfig,
        iface_id: IfaceId,
    ) {
        let rec = match self.records.get_mut(&addr) {
            Some(rec) => rec,
            None => {
                // Unsolicited learning of a neighbor nobody asked
                // about yet.
                if self.records.len() >= LLS_CACHE_RECORDS {
                    return;
                }
                let iface = match net.iface(iface_id) {
                    Some(iface) => iface,
                    None => &net.front,
                };
                self.records.insert(
                    addr,
                    Record {
                        addr,
                        iface: iface_id,
                        port: iface.port,
                        mac: Some(mac),
                        stale: source == ObserveSource::Unsolicited,
                        last_confirmed_at: now,
                        probe_sent_at: None,
                        ttl_cycles: self
                            .clocks
                            .from_secs(F::timeout_sec(iface).into()),
                        holds: Vec::new(),
                    },
                );
                return;
            }
        };

        let changed = rec.mac != Some(mac);
        rec.mac = Some(mac);
        match source {
            ObserveSource::Solicited => {
                rec.stale = false;
                rec.probe_sent_at = None;
                rec.last_confirmed_at = now;
            }
            ObserveSource::Unsolicited => {
                if changed {
                    rec.stale = true;
                }
            }
        }

        if changed {
            let map = rec.map(F::to_ip).unwrap();
            rec.holds.retain_mut(|h| {
                (h.cb)(LlsReply::Resolved(&map)) == HoldAction::CallAgain
            });
        }
    }

    /// One aging pass. Fresh records are left alone. Expired records
    /// with holds get re-probed (solicitations are returned for the
    /// caller to transmit); expired records without holds are removed.
    /// A probe that has been out for a full `probe_timeout` takes its
    /// record with it, cancelling the holds.
    pub fn scan(
        &mut self,
        now: u64,
        net: &NetConfig,
        probe_timeout: u64,
    ) -> Vec<(IfaceId, PktBuf)> {
        let mut solicits = Vec::new();
        let mut dead = Vec::new();

        for (addr, rec) in self.records.iter_mut() {
            if let Some(sent) = rec.probe_sent_at {
                if now.saturating_sub(sent) >= probe_timeout {
                    dead.push(*addr);
                }
                continue;
            }

            if rec.fresh(now) {
                continue;
            }

            if rec.holds.is_empty() {
                dead.push(*addr);
                continue;
            }

            rec.stale = true;
            rec.probe_sent_at = Some(now);
            let iface = match net.iface(rec.iface) {
                Some(iface) => iface,
                None => &net.front,
            };
            solicits.push((rec.iface, F::solicit_frame(iface, addr, rec.mac)));
        }

        for addr in dead {
            if let Some(mut rec) = self.records.remove(&addr) {
                for hold in rec.holds.iter_mut() {
                    let _ = (hold.cb)(LlsReply::Cancelled);
                }
            }
        }

        solicits
    }

    /// Tear the cache down, cancelling every remaining hold.
    pub fn destroy(&mut self) {
        let records = core::mem::take(&mut self.records);
        for (_, mut rec) in records {
            for hold in rec.holds.iter_mut() {
                let _ = (hold.cb)(LlsReply::Cancelled);
            }
        }
    }

    /// Render every record, for the debug dump.
    pub fn dump(&self) -> Vec<String> {
        self.records
            .values()
            .map(|rec| {
                let mac = match rec.mac {
                    Some(mac) => format!("{mac}"),
                    None => String::from("(unresolved)"),
                };
                format!(
                    "{} cache: {} -> {}{}{} holds={}",
                    F::NAME,
                    rec.addr,
                    mac,
                    if rec.stale { " stale" } else { "" },
                    if rec.probe_sent_at.is_some() {
                        " probing"
                    } else {
                        ""
                    },
                    rec.holds.len(),
                )
            })
            .collect()
    }
}

impl<F: LinkFamily> Drop for LinkCache<F> {
    fn drop(&mut self) {
        self.destroy();
    }
}
