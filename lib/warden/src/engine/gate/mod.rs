// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-flow admission state machine.
//!
//! Every flow entry is in one of three states. In *request* the source
//! has no capability: each packet is forwarded as a request whose
//! priority encodes how long the source waited since its previous
//! packet. In *granted* the flow holds a time-bounded capability with
//! a byte budget per second, periodically re-marked as a renewal so
//! the grantor can extend or revoke it. In *declined* everything is
//! dropped until the punishment lapses.

pub mod worker;

use crate::time::Clocks;
use warden_api::FlowKey;

/// Priority a brand-new request flow starts at.
pub const START_PRIORITY: u8 = 38;

/// Twice the size of a large DNS reply, in packets: the burst a source
/// may send at its earned priority without re-waiting.
pub const START_ALLOWANCE: u8 = 8;

/// DSCP values on encapsulated packets. 0 is legacy traffic, never
/// emitted here; requests occupy 3..=63.
pub const PRIORITY_GRANTED: u8 = 1;
pub const PRIORITY_RENEW_CAP: u8 = 2;
pub const PRIORITY_MAX: u8 = 63;

/// State-specific data of a flow waiting for a verdict.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequestBlock {
    /// When the entry's previous packet was seen, in cycles.
    pub last_seen_at: u64,
    /// The priority assigned to that packet.
    pub last_priority: u8,
    /// Packets left to send at `last_priority` without earning it
    /// again.
    pub allowance: u8,
}

/// State-specific data of a flow holding a capability.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GrantedBlock {
    /// When the capability lapses.
    pub cap_expire_at: u64,
    /// When the byte budget next resets.
    pub budget_renew_at: u64,
    /// Budget per window: `tx_rate_kb_cycle * 1024` bytes.
    pub tx_rate_kb_cycle: u64,
    /// Bytes the source may still send in the current window.
    pub budget_byte: u64,
    /// When the next renewal marking is due.
    pub send_next_renewal_at: u64,
    /// Cycles between renewal markings.
    pub renewal_step_cycle: u64,
}

/// State-specific data of a punished flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeclinedBlock {
    /// When the punishment lapses.
    pub expire_at: u64,
}

/// The tagged per-state block. Being a sum type, data of a state other
/// than the current one does not exist to be touched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowState {
    Request(RequestBlock),
    Granted(GrantedBlock),
    Declined(DeclinedBlock),
}

impl FlowState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Granted(_) => "granted",
            Self::Declined(_) => "declined",
        }
    }
}

/// One known flow.
#[derive(Clone, Copy, Debug)]
pub struct FlowEntry {
    pub flow: FlowKey,
    /// Which grantor decides about this flow; opaque, from route
    /// lookup.
    pub grantor_id: u32,
    pub state: FlowState,
}

impl FlowEntry {
    /// A fresh entry in request state, as created by a first packet or
    /// a policy that outran one.
    pub fn new(flow: FlowKey, now: u64) -> Self {
        Self {
            flow,
            grantor_id: 0,
            state: FlowState::Request(RequestBlock {
                last_seen_at: now,
                last_priority: START_PRIORITY,
                allowance: START_ALLOWANCE - 1,
            }),
        }
    }

    /// Send the entry back to request state, keeping only the flow.
    pub fn reinitialize(&mut self, now: u64) {
        self.grantor_id = 0;
        self.state = FlowState::Request(RequestBlock {
            last_seen_at: now,
            last_priority: START_PRIORITY,
            allowance: START_ALLOWANCE - 1,
        });
    }
}

/// What classification decided for one packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Encapsulate with this DSCP and transmit toward the grantor.
    Forward { dscp: u8 },
    /// Drop the packet.
    Drop(DropReason),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The granted budget cannot cover the packet.
    Budget,
    /// The flow is under an active punishment.
    Declined,
}

/// Convert the gap since the previous packet into a priority: the
/// integer log2 of the gap in picoseconds. A source that waited longer
/// bids higher.
///
/// `now < past` should never happen, but clocks have misbehaved on
/// real silicon; treat it as no gap and let the caller log it.
pub fn priority_from_delta_time(
    now: u64,
    past: u64,
    clocks: &Clocks,
) -> (u8, bool) {
    if now < past {
        return (0, true);
    }

    let delta_time = (now - past).saturating_mul(clocks.picos_per_cycle());
    if delta_time < 1 {
        return (0, false);
    }

    (63 - delta_time.leading_zeros() as u8, false)
}

/// Remap a derived priority onto the DSCP request band (3..=63).
pub fn request_dscp(priority: u8) -> u8 {
    let dscp = priority + 3;
    if dscp > PRIORITY_MAX {
        PRIORITY_MAX
    } else {
        dscp
    }
}

/// Classification outcome plus whether the clock ran backwards (the
/// caller owns logging).
pub struct Classified {
    pub verdict: Verdict,
    pub clock_went_backwards: bool,
}

/// Run one packet of `pkt_len` bytes through the entry's state
/// machine at time `now`, mutating the entry.
pub fn classify(
    fe: &mut FlowEntry,
    pkt_len: usize,
    now: u64,
    clocks: &Clocks,
) -> Classified {
    // A lapsed capability or punishment sends the flow back to request
    // state before its packet is classified.
    let lapsed = match &fe.state {
        FlowState::Request(_) => false,
        FlowState::Granted(granted) => now >= granted.cap_expire_at,
        FlowState::Declined(declined) => now >= declined.expire_at,
    };
    if lapsed {
        fe.reinitialize(now);
    }

    let mut clock_went_backwards = false;

    let verdict = match &mut fe.state {
        FlowState::Request(req) => {
            let (mut priority, backwards) =
                priority_from_delta_time(now, req.last_seen_at, clocks);
            clock_went_backwards = backwards;

            req.last_seen_at = now;

            // "<" rather than "<=": the equal case means the source
            // waited long enough to earn the same priority again, so
            // it is awarded a fresh allowance.
            if priority < req.last_priority && req.allowance > 0 {
                req.allowance -= 1;
                priority = req.last_priority;
            } else {
                req.last_priority = priority;
                req.allowance = START_ALLOWANCE - 1;
            }

            Verdict::Forward { dscp: request_dscp(priority) }
        }

        FlowState::Granted(granted) => {
            if now >= granted.budget_renew_at {
                granted.budget_renew_at = now + clocks.from_secs(1);
                granted.budget_byte = granted.tx_rate_kb_cycle * 1024;
            }

            if pkt_len as u64 > granted.budget_byte {
                Verdict::Drop(DropReason::Budget)
            } else {
                granted.budget_byte -= pkt_len as u64;

                let dscp = if now >= granted.send_next_renewal_at {
                    granted.send_next_renewal_at =
                        now + granted.renewal_step_cycle;
                    PRIORITY_RENEW_CAP
                } else {
                    PRIORITY_GRANTED
                };
                Verdict::Forward { dscp }
            }
        }

        FlowState::Declined(_) => Verdict::Drop(DropReason::Declined),
    };

    Classified { verdict, clock_went_backwards }
}
