//! Query result types and the rows map
//!
//! Scanned rows fold into a [`RowsMap`] keyed by the projected output key;
//! finalization turns the map into an ordered, truncated row list with a
//! summary.

use crate::{Direction, ProbeError, Result, Timestamp, Val};
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::str::FromStr;

/// Result status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Ok,
    Empty,
    Partial,
    Error,
}

/// Status of a query (or of one host in a distributed query)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            code: StatusCode::Empty,
            message: "no flows found".into(),
        }
    }

    pub fn partial(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Partial,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: message.into(),
        }
    }
}

/// Sort key of the final row list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Packets,
    Bytes,
    Time,
}

impl FromStr for SortBy {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "packets" => Ok(SortBy::Packets),
            "bytes" => Ok(SortBy::Bytes),
            "time" => Ok(SortBy::Time),
            other => Err(ProbeError::Query(format!(
                "unknown sorting parameter '{}' specified",
                other
            ))),
        }
    }
}

/// Complete sort specification
#[derive(Debug, Clone, Copy)]
pub struct SortOrder {
    pub sort_by: SortBy,
    pub direction: Direction,
    pub ascending: bool,
}

/// The projected output key of a row
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub timestamp: Option<Timestamp>,
    pub iface: Option<String>,
    pub sip: Option<IpAddr>,
    pub dip: Option<IpAddr>,
    pub dport: Option<u16>,
    pub proto: Option<u8>,
}

/// Non-attribute labels of an output row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iface: Option<String>,
}

impl Labels {
    fn is_empty(&self) -> bool {
        self.timestamp.is_none() && self.iface.is_none()
    }
}

/// Projected 5-tuple attributes of an output row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "proto_name_serde",
        default
    )]
    pub proto: Option<u8>,
}

impl Attributes {
    fn is_empty(&self) -> bool {
        self.sip.is_none() && self.dip.is_none() && self.dport.is_none() && self.proto.is_none()
    }
}

// the protocol attribute travels as its name (`"TCP"`), falling back to the
// raw number for unnamed protocols
mod proto_name_serde {
    use crate::protocols;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<u8>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(proto) => s.serialize_str(&protocols::proto_name(*proto)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u8>, D::Error> {
        let name: Option<String> = Option::deserialize(d)?;
        match name {
            None => Ok(None),
            Some(name) => {
                if let Ok(num) = name.parse::<u8>() {
                    return Ok(Some(num));
                }
                protocols::proto_number(&name)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("unknown protocol '{}'", name)))
            }
        }
    }
}

/// One output row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
    pub counters: Val,
}

impl Row {
    fn from_parts(key: RowKey, counters: Val) -> Self {
        Self {
            labels: Labels {
                timestamp: key.timestamp,
                iface: key.iface,
            },
            attributes: Attributes {
                sip: key.sip,
                dip: key.dip,
                dport: key.dport,
                proto: key.proto,
            },
            counters,
        }
    }

    fn key(&self) -> RowKey {
        RowKey {
            timestamp: self.labels.timestamp,
            iface: self.labels.iface.clone(),
            sip: self.attributes.sip,
            dip: self.attributes.dip,
            dport: self.attributes.dport,
            proto: self.attributes.proto,
        }
    }
}

/// Aggregation map from projected key to counters
#[derive(Debug, Default)]
pub struct RowsMap {
    inner: HashMap<RowKey, Val, RandomState>,
}

impl RowsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one source row's counters into the map
    pub fn fold(&mut self, key: RowKey, val: Val) {
        self.inner.entry(key).or_default().add(&val);
    }

    /// Merge externally produced rows, returning how many of them landed on
    /// a key that already existed (used to deduct double-counted hits)
    pub fn merge_rows(&mut self, rows: Vec<Row>) -> usize {
        let mut merged = 0;
        for row in rows {
            let key = row.key();
            if let Some(existing) = self.inner.get_mut(&key) {
                existing.add(&row.counters);
                merged += 1;
            } else {
                self.inner.insert(key, row.counters);
            }
        }
        merged
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Convert into the final ordered row list
    pub fn into_rows_sorted(self, order: SortOrder) -> Vec<Row> {
        let mut entries: Vec<(RowKey, Val)> = self.inner.into_iter().collect();

        match order.sort_by {
            SortBy::Time => {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            SortBy::Packets => {
                entries.sort_by(|a, b| {
                    sort_packets(&b.1, order.direction)
                        .cmp(&sort_packets(&a.1, order.direction))
                        .then_with(|| a.0.cmp(&b.0))
                });
            }
            SortBy::Bytes => {
                entries.sort_by(|a, b| {
                    sort_bytes(&b.1, order.direction)
                        .cmp(&sort_bytes(&a.1, order.direction))
                        .then_with(|| a.0.cmp(&b.0))
                });
            }
        }

        // counter sorts are descending by default; time sorts ascending
        let flip = match order.sort_by {
            SortBy::Time => !order.ascending,
            _ => order.ascending,
        };
        if flip {
            entries.reverse();
        }

        entries
            .into_iter()
            .map(|(key, val)| Row::from_parts(key, val))
            .collect()
    }
}

fn sort_packets(val: &Val, direction: Direction) -> u64 {
    match direction {
        Direction::In => val.pkts_rcvd,
        Direction::Out => val.pkts_sent,
        Direction::Both | Direction::Sum => val.total_packets(),
    }
}

fn sort_bytes(val: &Val, direction: Direction) -> u64 {
    match direction {
        Direction::In => val.bytes_rcvd,
        Direction::Out => val.bytes_sent,
        Direction::Both | Direction::Sum => val.total_bytes(),
    }
}

/// Hit accounting of a query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hits {
    pub total: usize,
    pub displayed: usize,
}

/// Aggregate summary of a query result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub first: Timestamp,
    pub last: Timestamp,
    pub interfaces: Vec<String>,
    pub totals: Val,
    pub hits: Hits,
}

/// Complete result of one query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts_statuses: BTreeMap<String, Status>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    pub status: Status,
}

impl QueryResult {
    /// An empty result with the given status
    pub fn with_status(query: impl Into<String>, status: Status) -> Self {
        Self {
            rows: Vec::new(),
            summary: Summary::default(),
            hosts_statuses: BTreeMap::new(),
            query: query.into(),
            status,
        }
    }
}
