// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The engine: per-flow admission and link-layer resolution.

pub mod encap;
pub mod flow_table;
pub mod gate;
pub mod lls;
pub mod packet;

use encap::TunnelInfo;
use warden_api::IpAddr;

/// Why a frame did not yield a flow key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Not an IPv4 or IPv6 frame.
    NotIp(u16),
    /// IPv6 with an extension header; only the fixed header is
    /// followed.
    ExtensionHeader(u8),
    /// Too short for the headers it claims.
    Truncated,
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::NotIp(ethertype) => {
                write!(f, "not an IP frame (ethertype {ethertype:#06x})")
            }
            Self::ExtensionHeader(hdr) => {
                write!(f, "IPv6 extension header {hdr} rejected")
            }
            Self::Truncated => write!(f, "frame truncated"),
        }
    }
}

/// What the route lookup hands back for a destination: which grantor
/// decides about the flow, and how to reach it.
#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub grantor_id: u32,
    pub tunnel: TunnelInfo,
}

/// The route-lookup collaborator. The engine treats the result as
/// opaque: it stamps `grantor_id` into the flow entry and hands
/// `tunnel` to encapsulation.
pub trait RouteLookup: Send + Sync {
    fn route(&self, dst: &IpAddr) -> RouteEntry;
}

/// A single-grantor route table: every destination maps to the one
/// configured tunnel.
#[derive(Clone, Debug)]
pub struct StaticRoute {
    pub entry: RouteEntry,
}

impl RouteLookup for StaticRoute {
    fn route(&self, _dst: &IpAddr) -> RouteEntry {
        self.entry.clone()
    }
}
