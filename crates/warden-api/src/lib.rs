// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the warden data-plane engine and the
//! processes that feed it: addresses, flow keys, and the policy
//! decisions delivered to the per-flow admission workers.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod ip;
pub mod mac;
pub mod policy;

pub use ip::*;
pub use mac::*;
pub use policy::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment, so that
/// a policy feeder and an engine can verify they were compiled against
/// the same contract.
pub const API_VERSION: u64 = 1;

/// Errors surfaced across the engine boundary.
///
/// All errors are local to the worker that hit them; none unwinds
/// across a worker. Callers that receive one decide for their own work
/// item whether to retry, drop, or escalate.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub enum WardenError {
    /// A flow entry or table slot was found in a shape the state
    /// machine cannot act on. The offending packet is dropped.
    BadState(String),

    /// A producer tried to enqueue on a full mailbox.
    MailboxFull,

    /// The flow table cannot accept another entry.
    MaxCapacity(u64),

    /// The frame could not be parsed to a flow key.
    ParseError(String),

    /// A queue of the requested type could not be assigned on the
    /// interface.
    QueueExhausted { iface: String, requested: u64 },

    /// The resolution service for the requested address family is not
    /// enabled on any interface.
    ServiceDisabled,

    /// The NIC rejected part of a transmit burst; the caller owns (and
    /// frees) the unsent frames.
    TxFailure { requested: usize, sent: usize },
}

impl Display for WardenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
