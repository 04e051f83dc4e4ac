// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Link-layer support: resolving next-hop Ethernet addresses.
//!
//! A single worker runs ARP for IPv4 and neighbor discovery for IPv6
//! on both interfaces, answers solicitations addressed to the gateway,
//! and keeps an aging cache of resolutions. Other workers never touch
//! the cache: they subscribe with *hold* requests through the LLS
//! mailbox and get their callback invoked (always on the LLS worker)
//! when a resolution appears or changes, until they *put* the hold
//! back.

pub mod arp;
pub mod cache;
pub mod ndisc;
pub mod worker;

use crate::engine::packet::PktBuf;
use crate::mailbox::Mailbox;
use crate::net::IfaceId;
use alloc::boxed::Box;
use alloc::sync::Arc;
use warden_api::IpAddr;
use warden_api::Ipv4Addr;
use warden_api::Ipv6Addr;
use warden_api::MacAddr;
use warden_api::WardenError;

/// Number of records a resolution cache can hold, per family.
pub const LLS_CACHE_RECORDS: usize = 1024;

/// A resolution as delivered to holders.
#[derive(Clone, Copy, Debug)]
pub struct LinkMap {
    pub addr: IpAddr,
    pub mac: MacAddr,
    /// NIC port the mapping was learned on.
    pub port: u16,
    /// Set once the mapping outlives its TTL; it remains usable while
    /// a re-probe is in flight.
    pub stale: bool,
}

/// What a hold callback is being told.
#[derive(Debug)]
pub enum LlsReply<'a> {
    /// A resolution (or an update to one).
    Resolved(&'a LinkMap),
    /// The hold is gone: cache teardown or record removal. This is
    /// the last invocation; release any state attached to the hold.
    Cancelled,
}

/// Whether the holder wants future updates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HoldAction {
    CallAgain,
    Release,
}

/// Callback invoked by the LLS worker to deliver [`LlsReply`]s. It
/// runs on the LLS worker's core: implementations must hand results
/// off (typically through their own mailbox) rather than compute.
pub type HoldCallback = Box<dyn FnMut(LlsReply) -> HoldAction + Send>;

/// A subscription to one resolution.
pub struct Hold {
    /// Worker that owns the subscription; one hold per (address,
    /// worker).
    pub worker_id: u32,
    pub cb: HoldCallback,
}

impl core::fmt::Debug for Hold {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Hold {{ worker_id: {} }}", self.worker_id)
    }
}

/// Requests other workers drop in the LLS mailbox.
pub enum LlsRequest {
    HoldV4 { ip: Ipv4Addr, hold: Hold },
    PutV4 { ip: Ipv4Addr, worker_id: u32 },
    HoldV6 { ip: Ipv6Addr, hold: Hold },
    PutV6 { ip: Ipv6Addr, worker_id: u32 },
    /// A neighbor discovery frame another worker pulled off its own
    /// queue and is handing over.
    Nd { pkt: PktBuf, iface: IfaceId },
}

/// The producer-side handle to the LLS worker. Cheap to clone; one per
/// worker that needs resolutions.
#[derive(Clone)]
pub struct LlsHandle {
    requests: Arc<Mailbox<LlsRequest>>,
    arp_enabled: bool,
    nd_enabled: bool,
}

impl LlsHandle {
    pub fn new(
        requests: Arc<Mailbox<LlsRequest>>,
        arp_enabled: bool,
        nd_enabled: bool,
    ) -> Self {
        Self { requests, arp_enabled, nd_enabled }
    }

    fn submit(&self, req: LlsRequest) -> Result<(), WardenError> {
        self.requests.enqueue(req).map_err(|_| WardenError::MailboxFull)
    }

    /// Subscribe `worker_id` to the resolution of `ip`.
    pub fn hold_v4(
        &self,
        ip: Ipv4Addr,
        cb: HoldCallback,
        worker_id: u32,
    ) -> Result<(), WardenError> {
        if !self.arp_enabled {
            return Err(WardenError::ServiceDisabled);
        }
        self.submit(LlsRequest::HoldV4 { ip, hold: Hold { worker_id, cb } })
    }

    /// Drop `worker_id`'s subscription to `ip`.
    pub fn put_v4(
        &self,
        ip: Ipv4Addr,
        worker_id: u32,
    ) -> Result<(), WardenError> {
        if !self.arp_enabled {
            return Err(WardenError::ServiceDisabled);
        }
        self.submit(LlsRequest::PutV4 { ip, worker_id })
    }

    pub fn hold_v6(
        &self,
        ip: Ipv6Addr,
        cb: HoldCallback,
        worker_id: u32,
    ) -> Result<(), WardenError> {
        if !self.nd_enabled {
            return Err(WardenError::ServiceDisabled);
        }
        self.submit(LlsRequest::HoldV6 { ip, hold: Hold { worker_id, cb } })
    }

    pub fn put_v6(
        &self,
        ip: Ipv6Addr,
        worker_id: u32,
    ) -> Result<(), WardenError> {
        if !self.nd_enabled {
            return Err(WardenError::ServiceDisabled);
        }
        self.submit(LlsRequest::PutV6 { ip, worker_id })
    }

    /// Hand a neighbor discovery frame received elsewhere to the LLS
    /// worker.
    pub fn submit_nd(
        &self,
        pkt: PktBuf,
        iface: IfaceId,
    ) -> Result<(), WardenError> {
        if !self.nd_enabled {
            return Err(WardenError::ServiceDisabled);
        }
        self.submit(LlsRequest::Nd { pkt, iface })
    }
}
