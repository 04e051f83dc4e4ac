// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The packet-processing data plane of a DoS-mitigation gateway.
//!
//! Traffic from the Internet arrives on a *front* interface; admitted
//! packets are IP-in-IP encapsulated toward a grantor decision service
//! over the *back* interface. Two kinds of run-to-completion workers
//! make up the plane: admission workers keeping a per-flow state
//! machine ([`engine::gate`]) and a single link-layer resolution
//! worker running ARP and IPv6 ND ([`engine::lls`]). Workers drive the
//! NIC through poll-mode bursts ([`net::NicPort`]) and talk to each
//! other only through bounded lock-free mailboxes ([`mailbox`]).

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate cfg_if;

use alloc::boxed::Box;
use core::fmt;
use core::fmt::Display;

pub mod api {
    pub use warden_api::*;
}

pub mod engine;
pub mod mailbox;
pub mod net;
pub mod time;

// ================================================================
// Providers
//
// Providers let the engine run in different contexts by plugging in
// implementations of core services. Logging is one: tests and
// userspace embeddings print, a production launcher can route to its
// own transport. The NIC itself is another (see net::NicPort).
// ================================================================

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
/// For example, in a unit test this maps to `println!`.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{}", level_s)
    }
}

#[cfg(any(feature = "std", test))]
#[derive(Clone, Copy)]
pub struct PrintlnLog {}

#[cfg(any(feature = "std", test))]
impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{} {}", level, msg);
    }
}

pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
}

impl ExecCtx {
    pub fn note(&self, msg: &str) {
        self.log.log(LogLevel::Note, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log.log(LogLevel::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log.log(LogLevel::Error, msg);
    }
}

/// Suppress all but a sample of a high-frequency log site.
///
/// Per-packet error paths must not turn line-rate garbage into
/// line-rate logging. Call [`RateLimited::admit`] at the log site; it
/// returns true for the first event and then once per `every`.
#[derive(Debug)]
pub struct RateLimited {
    every: u64,
    count: u64,
}

impl RateLimited {
    pub const fn new(every: u64) -> Self {
        Self { every, count: 0 }
    }

    pub fn admit(&mut self) -> bool {
        let admit = self.count % self.every == 0;
        self.count += 1;
        admit
    }

    /// Total events seen, admitted or not.
    pub fn seen(&self) -> u64 {
        self.count
    }
}
