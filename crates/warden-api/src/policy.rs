// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Policy decisions delivered to the admission workers.
//!
//! A grantor reaches a verdict about a flow and a feeder process turns
//! it into a [`Policy`], enqueued on the mailbox of the worker that
//! owns the flow (the feeder replays the NIC's RSS steering to find
//! it). The worker applies it to the flow entry, creating the entry if
//! the decision outran the first packet.

use crate::ip::FlowKey;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Parameters of a positive admission decision: a time-bounded
/// capability to send at a given rate.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct GrantedParams {
    /// Sending budget, in kilobytes per second.
    pub tx_rate_kb_sec: u32,

    /// Lifetime of the capability, in seconds. When it lapses the flow
    /// falls back to request state.
    pub cap_expire_sec: u32,

    /// Delay until the first capability renewal is emitted, in
    /// milliseconds.
    pub next_renewal_ms: u32,

    /// Interval between subsequent renewals, in milliseconds.
    pub renewal_step_ms: u32,
}

/// Parameters of a negative admission decision.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct DeclinedParams {
    /// Lifetime of the punishment, in seconds.
    pub expire_sec: u32,
}

/// The decision itself.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum PolicyParams {
    Granted(GrantedParams),
    Declined(DeclinedParams),
}

/// A policy decision for one flow.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Policy {
    pub flow: FlowKey,
    pub params: PolicyParams,
}

impl Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.params {
            PolicyParams::Granted(p) => write!(
                f,
                "GRANTED {} ({} kB/s, expires {}s)",
                self.flow, p.tx_rate_kb_sec, p.cap_expire_sec,
            ),
            PolicyParams::Declined(p) => {
                write!(f, "DECLINED {} (expires {}s)", self.flow, p.expire_sec)
            }
        }
    }
}
