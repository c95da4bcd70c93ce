// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint bookkeeping for local bind targets and remote peer candidates.

use bitflags::bitflags;
use std::{collections::BTreeMap, fmt, net::SocketAddr};

bitflags! {
    /// Where an endpoint was learned from, and how it should be used.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EpFlags: u32 {
        /// Statically configured.
        const CONF = 1 << 0;
        /// Discovered dynamically (advertised by the peer, DNS, ...).
        const DISC = 1 << 1;
        /// Learned from the socket itself.
        const LL = 1 << 2;
        /// Primary address of the association.
        const PRIMARY = 1 << 3;
        /// Stands for "any address" on this host.
        const ACCEPT_ALL = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub flags: EpFlags,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.addr, self.flags)
    }
}

/// Set of endpoints, unique by (family, address, port). Merging a duplicate
/// ORs the flag sets together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSet {
    entries: BTreeMap<SocketAddr, EpFlags>,
}

impl EndpointSet {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_merge(&mut self, addr: SocketAddr, flags: EpFlags) {
        *self.entries.entry(addr).or_insert(EpFlags::empty()) |= flags;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.entries
            .iter()
            .map(|(addr, flags)| Endpoint {
                addr: *addr,
                flags: *flags,
            })
    }

    /// Endpoints whose flags match `value` under `mask`.
    pub fn matching(&self, mask: EpFlags, value: EpFlags) -> impl Iterator<Item = Endpoint> + '_ {
        self.iter().filter(move |ep| ep.flags & mask == value)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn flags(&self, addr: &SocketAddr) -> Option<EpFlags> {
        self.entries.get(addr).copied()
    }

    /// Candidate addresses for a multi-address connect, in priority order:
    /// configured endpoints first, then discovered ones, then the rest.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(self.entries.len());
        for ep in self.matching(EpFlags::CONF, EpFlags::CONF) {
            out.push(ep.addr);
        }
        for ep in self.matching(EpFlags::CONF | EpFlags::DISC, EpFlags::DISC) {
            out.push(ep.addr);
        }
        for ep in self.matching(EpFlags::CONF | EpFlags::DISC, EpFlags::empty()) {
            out.push(ep.addr);
        }
        out
    }
}

impl FromIterator<(SocketAddr, EpFlags)> for EndpointSet {
    fn from_iter<I: IntoIterator<Item = (SocketAddr, EpFlags)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (addr, flags) in iter {
            set.add_merge(addr, flags);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn merge_ors_flags() {
        let mut set = EndpointSet::new();
        set.add_merge(ep("192.0.2.1:3868"), EpFlags::CONF);
        set.add_merge(ep("192.0.2.1:3868"), EpFlags::PRIMARY);
        set.add_merge(ep("192.0.2.1:3869"), EpFlags::DISC);

        assert_eq!(set.len(), 2);
        assert_eq!(
            set.flags(&ep("192.0.2.1:3868")),
            Some(EpFlags::CONF | EpFlags::PRIMARY)
        );
    }

    #[test]
    fn families_are_distinct() {
        let mut set = EndpointSet::new();
        set.add_merge(ep("192.0.2.1:3868"), EpFlags::CONF);
        set.add_merge(ep("[2001:db8::1]:3868"), EpFlags::CONF);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn candidate_priority_order() {
        let mut set = EndpointSet::new();
        set.add_merge(ep("10.0.0.3:3868"), EpFlags::LL);
        set.add_merge(ep("10.0.0.2:3868"), EpFlags::DISC);
        set.add_merge(ep("10.0.0.1:3868"), EpFlags::CONF);

        let candidates = set.candidates();
        assert_eq!(
            candidates,
            vec![
                ep("10.0.0.1:3868"),
                ep("10.0.0.2:3868"),
                ep("10.0.0.3:3868"),
            ]
        );
    }

    #[test]
    fn configured_and_discovered_counts_as_configured() {
        let mut set = EndpointSet::new();
        set.add_merge(ep("10.0.0.1:3868"), EpFlags::CONF | EpFlags::DISC);
        set.add_merge(ep("10.0.0.2:3868"), EpFlags::DISC);

        let candidates = set.candidates();
        assert_eq!(candidates, vec![ep("10.0.0.1:3868"), ep("10.0.0.2:3868")]);
    }
}
