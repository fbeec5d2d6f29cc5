//! Aggregation flow map
//!
//! Maps 5-tuple keys to their four traffic counters. IPv4 and IPv6 keys live
//! in separate tables so the v4 table stores its 14-byte keys densely. The
//! map has a single mutating owner (the interface's capture thread); rotation
//! transfers the whole value to the writer, so no internal locking is needed.

use crate::{Key, KeyV4, KeyV6, Val};
use ahash::RandomState;
use std::collections::HashMap;
use std::net::IpAddr;

/// A flow key of either address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKey {
    V4(KeyV4),
    V6(KeyV6),
}

impl FlowKey {
    /// Build a key from packet header fields
    pub fn from_packet(sip: IpAddr, dip: IpAddr, dport: u16, proto: u8) -> Self {
        match (sip, dip) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                FlowKey::V4(Key::new(s.octets(), d.octets(), dport, proto))
            }
            // mixed-family packets are keyed by their v6 mapping
            (s, d) => FlowKey::V6(Key::new(
                to_v6_octets(s),
                to_v6_octets(d),
                dport,
                proto,
            )),
        }
    }
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// A flattened `(key, counters)` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry<const W: usize> {
    pub key: Key<W>,
    pub val: Val,
}

/// In-memory aggregation from 5-tuple key to counters, split by family
#[derive(Debug, Default)]
pub struct FlowMap {
    v4: HashMap<KeyV4, Val, RandomState>,
    v6: HashMap<KeyV6, Val, RandomState>,
}

impl FlowMap {
    /// Create an empty flow map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a packet observation to the flow identified by `key`
    pub fn update(&mut self, key: FlowKey, inbound: bool, bytes: u64, pkts: u64) {
        match key {
            FlowKey::V4(k) => self.v4.entry(k).or_default().account(inbound, bytes, pkts),
            FlowKey::V6(k) => self.v6.entry(k).or_default().account(inbound, bytes, pkts),
        }
    }

    /// Number of tracked flows across both families
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// True if no flows are tracked
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Flatten into per-family entry lists, each sorted byte-lexicographically
    /// on `(sip, dip, dport, proto)`. The sort gives the attribute columns the
    /// locality that makes them compress well.
    pub fn flatten(&self) -> (Vec<FlowEntry<4>>, Vec<FlowEntry<16>>) {
        let mut v4: Vec<FlowEntry<4>> = self
            .v4
            .iter()
            .map(|(key, val)| FlowEntry { key: *key, val: *val })
            .collect();
        let mut v6: Vec<FlowEntry<16>> = self
            .v6
            .iter()
            .map(|(key, val)| FlowEntry { key: *key, val: *val })
            .collect();

        v4.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        v6.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        (v4, v6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_update_aggregates_across_source_ports() {
        let mut map = FlowMap::new();
        // two packets of the same flow; the source port never enters the key
        let key = FlowKey::from_packet(v4(1, 2, 3, 4), v4(4, 5, 6, 7), 2, 6);
        map.update(key, true, 128, 1);
        map.update(key, true, 64, 1);

        assert_eq!(map.len(), 1);
        let (v4_list, v6_list) = map.flatten();
        assert!(v6_list.is_empty());
        assert_eq!(v4_list[0].val.bytes_rcvd, 192);
        assert_eq!(v4_list[0].val.pkts_rcvd, 2);
        assert_eq!(v4_list[0].val.bytes_sent, 0);
    }

    #[test]
    fn test_direction_attribution() {
        let mut map = FlowMap::new();
        let key = FlowKey::from_packet(v4(10, 0, 0, 1), v4(10, 0, 0, 2), 443, 6);
        map.update(key, true, 100, 1);
        map.update(key, false, 50, 1);

        let (v4_list, _) = map.flatten();
        let val = v4_list[0].val;
        assert_eq!(val.bytes_rcvd, 100);
        assert_eq!(val.bytes_sent, 50);
        assert_eq!(val.pkts_rcvd, 1);
        assert_eq!(val.pkts_sent, 1);
    }

    #[test]
    fn test_family_split() {
        let mut map = FlowMap::new();
        map.update(
            FlowKey::from_packet(v4(1, 1, 1, 1), v4(2, 2, 2, 2), 80, 6),
            true,
            10,
            1,
        );
        map.update(
            FlowKey::from_packet(
                IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
                IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2)),
                53,
                17,
            ),
            false,
            20,
            1,
        );

        let (v4_list, v6_list) = map.flatten();
        assert_eq!(v4_list.len(), 1);
        assert_eq!(v6_list.len(), 1);
    }

    #[test]
    fn test_flatten_sorted() {
        let mut map = FlowMap::new();
        for d in [9u8, 3, 7, 1, 5] {
            map.update(
                FlowKey::from_packet(v4(1, 2, 3, d), v4(4, 5, 6, 7), 80, 6),
                true,
                1,
                1,
            );
        }

        let (v4_list, _) = map.flatten();
        let keys: Vec<_> = v4_list.iter().map(|e| e.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
