//! Core types for flowprobe

use crate::protocols;
use crate::{ProbeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// Upper bound for the `last` argument of a time range
pub const MAX_TIME: Timestamp = 4_102_444_800; // 2100-01-01T00:00:00Z

/// Width of an IPv4 address in bytes
pub const IPV4_WIDTH: usize = 4;

/// Width of an IPv6 address in bytes
pub const IPV6_WIDTH: usize = 16;

/// Width of the destination port in bytes (stored big-endian)
pub const PORT_WIDTH: usize = 2;

/// Flow key: the 5-tuple with the source port aggregated away.
///
/// The width parameter is the address width, so v4 keys are stored densely
/// (14 bytes) while v6 keys take 38 bytes. The derived ordering is the on-disk
/// sort order: byte-lexicographic on `(sip, dip, dport, proto)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key<const W: usize> {
    pub sip: [u8; W],
    pub dip: [u8; W],
    pub dport: [u8; PORT_WIDTH],
    pub proto: u8,
}

/// IPv4 flow key
pub type KeyV4 = Key<IPV4_WIDTH>;

/// IPv6 flow key
pub type KeyV6 = Key<IPV6_WIDTH>;

impl<const W: usize> Key<W> {
    /// Create a new key from its raw parts
    pub fn new(sip: [u8; W], dip: [u8; W], dport: u16, proto: u8) -> Self {
        Self {
            sip,
            dip,
            dport: dport.to_be_bytes(),
            proto,
        }
    }

    /// Destination port as a host-order integer
    pub fn dport(&self) -> u16 {
        u16::from_be_bytes(self.dport)
    }
}

impl<const W: usize> fmt::Display for Key<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            raw_ip_to_string(&self.sip),
            raw_ip_to_string(&self.dip),
            self.dport(),
            protocols::proto_name(self.proto),
        )
    }
}

/// Format a raw 4- or 16-byte address
pub fn raw_ip_to_string(raw: &[u8]) -> String {
    match raw.len() {
        IPV4_WIDTH => {
            let octets: [u8; 4] = raw.try_into().unwrap();
            Ipv4Addr::from(octets).to_string()
        }
        IPV6_WIDTH => {
            let octets: [u8; 16] = raw.try_into().unwrap();
            Ipv6Addr::from(octets).to_string()
        }
        _ => String::from("?"),
    }
}

/// Parse a raw 4- or 16-byte address back into an [`IpAddr`]
pub fn raw_ip_to_addr(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        IPV4_WIDTH => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IPV6_WIDTH => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Flow counters.
///
/// Counters saturate at `u64::MAX`; overflow within one rotation interval is
/// not reachable on any plausible link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Val {
    pub bytes_rcvd: u64,
    pub bytes_sent: u64,
    #[serde(rename = "packets_rcvd")]
    pub pkts_rcvd: u64,
    #[serde(rename = "packets_sent")]
    pub pkts_sent: u64,
}

impl Val {
    /// Account a packet observation in the given direction
    pub fn account(&mut self, inbound: bool, bytes: u64, pkts: u64) {
        if inbound {
            self.bytes_rcvd = self.bytes_rcvd.saturating_add(bytes);
            self.pkts_rcvd = self.pkts_rcvd.saturating_add(pkts);
        } else {
            self.bytes_sent = self.bytes_sent.saturating_add(bytes);
            self.pkts_sent = self.pkts_sent.saturating_add(pkts);
        }
    }

    /// Counter-wise saturating addition
    pub fn add(&mut self, other: &Val) {
        self.bytes_rcvd = self.bytes_rcvd.saturating_add(other.bytes_rcvd);
        self.bytes_sent = self.bytes_sent.saturating_add(other.bytes_sent);
        self.pkts_rcvd = self.pkts_rcvd.saturating_add(other.pkts_rcvd);
        self.pkts_sent = self.pkts_sent.saturating_add(other.pkts_sent);
    }

    /// Total traffic volume in bytes
    pub fn total_bytes(&self) -> u64 {
        self.bytes_rcvd.saturating_add(self.bytes_sent)
    }

    /// Total packet count
    pub fn total_packets(&self) -> u64 {
        self.pkts_rcvd.saturating_add(self.pkts_sent)
    }

    /// True if all four counters are zero
    pub fn is_zero(&self) -> bool {
        *self == Val::default()
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.pkts_rcvd, self.pkts_sent, self.bytes_rcvd, self.bytes_sent
        )
    }
}

/// Direction aggregation policy applied when folding rows into a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Keep received and sent counters separate
    Both,
    /// Collapse sent counters into the received ones
    Sum,
    /// Only received counters
    In,
    /// Only sent counters
    Out,
}

impl Direction {
    /// Apply the policy to a row's counters
    pub fn apply(&self, val: &Val) -> Val {
        match self {
            Direction::Both => *val,
            Direction::Sum => Val {
                bytes_rcvd: val.total_bytes(),
                bytes_sent: 0,
                pkts_rcvd: val.total_packets(),
                pkts_sent: 0,
            },
            Direction::In => Val {
                bytes_rcvd: val.bytes_rcvd,
                pkts_rcvd: val.pkts_rcvd,
                ..Val::default()
            },
            Direction::Out => Val {
                bytes_sent: val.bytes_sent,
                pkts_sent: val.pkts_sent,
                ..Val::default()
            },
        }
    }
}

/// An output-key attribute of the flow schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attribute {
    Sip,
    Dip,
    Dport,
    Proto,
}

impl Attribute {
    /// The attribute's stable column name
    pub fn name(&self) -> &'static str {
        match self {
            Attribute::Sip => "sip",
            Attribute::Dip => "dip",
            Attribute::Dport => "dport",
            Attribute::Proto => "proto",
        }
    }
}

/// Non-attribute output labels selected by a query type
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LabelSelector {
    pub timestamp: bool,
    pub iface: bool,
}

/// Parse a query type into its attributes and label selector.
///
/// A query type is a comma-separated subset of
/// `{sip, dip, dport, proto, iface, time}`, or one of the shorthand
/// aliases (`talk_conv`, `talk_src`, `talk_dst`, `apps_port`, `raw`).
pub fn parse_query_type(query: &str) -> Result<(Vec<Attribute>, LabelSelector)> {
    let expanded = match query.trim() {
        "talk_conv" => "sip,dip",
        "talk_src" => "sip",
        "talk_dst" => "dip",
        "apps_port" => "dport,proto",
        "raw" => "sip,dip,dport,proto",
        other => other,
    };

    let mut attributes = Vec::new();
    let mut selector = LabelSelector::default();
    for field in expanded.split(',') {
        let attribute = match field.trim() {
            "sip" | "src" => Attribute::Sip,
            "dip" | "dst" => Attribute::Dip,
            "dport" => Attribute::Dport,
            "proto" => Attribute::Proto,
            "time" => {
                selector.timestamp = true;
                continue;
            }
            "iface" => {
                selector.iface = true;
                continue;
            }
            unknown => {
                return Err(ProbeError::Query(format!(
                    "unknown query attribute '{}'",
                    unknown
                )))
            }
        };
        if !attributes.contains(&attribute) {
            attributes.push(attribute);
        }
    }

    if attributes.is_empty() && !selector.timestamp && !selector.iface {
        return Err(ProbeError::Query(format!("empty query type '{}'", query)));
    }

    Ok((attributes, selector))
}

/// Cooperative cancellation token threaded through long-running operations
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; all clones observe it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = KeyV4::new([1, 2, 3, 4], [4, 5, 6, 7], 80, 6);
        let b = KeyV4::new([1, 2, 3, 4], [4, 5, 6, 7], 80, 17);
        let c = KeyV4::new([1, 2, 3, 5], [0, 0, 0, 0], 0, 0);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_display() {
        let key = KeyV4::new([1, 2, 3, 4], [4, 5, 6, 7], 443, 6);
        assert_eq!(key.to_string(), "1.2.3.4,4.5.6.7,443,TCP");
    }

    #[test]
    fn test_val_saturation() {
        let mut val = Val {
            bytes_rcvd: u64::MAX - 10,
            ..Val::default()
        };
        val.account(true, 128, 1);
        assert_eq!(val.bytes_rcvd, u64::MAX);
        assert_eq!(val.pkts_rcvd, 1);
    }

    #[test]
    fn test_direction_policies() {
        let val = Val {
            bytes_rcvd: 128,
            bytes_sent: 64,
            pkts_rcvd: 2,
            pkts_sent: 1,
        };

        let sum = Direction::Sum.apply(&val);
        assert_eq!(sum.bytes_rcvd, 192);
        assert_eq!(sum.bytes_sent, 0);
        assert_eq!(sum.pkts_rcvd, 3);

        let inbound = Direction::In.apply(&val);
        assert_eq!(inbound.bytes_rcvd, 128);
        assert_eq!(inbound.bytes_sent, 0);

        let outbound = Direction::Out.apply(&val);
        assert_eq!(outbound.bytes_sent, 64);
        assert_eq!(outbound.bytes_rcvd, 0);
    }

    #[test]
    fn test_parse_query_type() {
        let (attrs, selector) = parse_query_type("sip,dip,dport,proto").unwrap();
        assert_eq!(
            attrs,
            vec![
                Attribute::Sip,
                Attribute::Dip,
                Attribute::Dport,
                Attribute::Proto
            ]
        );
        assert!(!selector.timestamp);

        let (attrs, selector) = parse_query_type("time").unwrap();
        assert!(attrs.is_empty());
        assert!(selector.timestamp);

        let (attrs, _) = parse_query_type("talk_conv").unwrap();
        assert_eq!(attrs, vec![Attribute::Sip, Attribute::Dip]);

        assert!(parse_query_type("sip,nope").is_err());
        assert!(parse_query_type("").is_err());
    }
}
