//! Query arguments, statements and the query engine
//!
//! [`Args`] is the external parameter surface (CLI/HTTP); [`Args::prepare`]
//! validates it into an executable [`Statement`] consumed by the planner and
//! runner.

pub mod planner;
pub mod results;
pub mod runner;
pub mod time;

pub use results::{
    Attributes, Hits, Labels, QueryResult, Row, RowKey, RowsMap, SortBy, SortOrder, Status,
    StatusCode, Summary,
};
pub use runner::QueryRunner;

use crate::capture::validate_iface_name;
use crate::conditions::{self, Node};
use crate::{
    parse_query_type, Attribute, CancelToken, Direction, LabelSelector, ProbeError, Result,
    Timestamp,
};
use serde::{Deserialize, Serialize};

/// Default number of returned rows
pub const DEFAULT_NUM_RESULTS: u64 = 1000;

/// Default maximum memory percentage granted to a query
pub const DEFAULT_MAX_MEM_PCT: usize = 60;

/// Row limit applied to untruncated (time) queries
pub const MAX_RESULTS: u64 = u32::MAX as u64;

/// Recognized output formats (rendering itself happens in the front-ends)
pub const PERMITTED_FORMATS: [&str; 3] = ["txt", "json", "csv"];

/// Anything that can execute a query, locally or on a remote host
pub trait Runner: Send + Sync {
    fn run(&self, token: &CancelToken, args: &Args) -> Result<QueryResult>;
}

/// Query arguments as supplied by callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    /// The query type, e.g. `sip,dip` or `talk_conv`
    pub query: String,
    /// Comma-separated interface list; `any` selects all present in the DB
    pub ifaces: String,

    /// Condition string filtering rows
    #[serde(skip_serializing_if = "String::is_empty")]
    pub condition: String,

    /// Counter handling: only received / only sent / collapsed
    #[serde(rename = "in")]
    pub r#in: bool,
    pub out: bool,
    pub sum: bool,

    /// Time selection (inclusive bounds; empty = unbounded)
    pub first: String,
    pub last: String,

    pub format: String,
    pub sort_by: String,
    pub num_results: u64,
    pub sort_ascending: bool,

    pub dns_resolution: DnsResolution,

    pub max_mem_pct: usize,
    pub low_mem: bool,

    /// Who produced these args
    #[serde(skip_serializing_if = "String::is_empty")]
    pub caller: String,

    /// Request live flow data in addition to the DB (handled by front-ends)
    pub live: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            query: String::new(),
            ifaces: String::new(),
            condition: String::new(),
            r#in: false,
            out: false,
            sum: false,
            first: "-30d".into(),
            last: crate::MAX_TIME.to_string(),
            format: "txt".into(),
            sort_by: "packets".into(),
            num_results: DEFAULT_NUM_RESULTS,
            sort_ascending: false,
            dns_resolution: DnsResolution::default(),
            max_mem_pct: DEFAULT_MAX_MEM_PCT,
            low_mem: false,
            caller: String::new(),
            live: false,
        }
    }
}

/// DNS reverse-resolution parameters (resolution itself is a collaborator of
/// the engine; the engine only validates and carries them)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsResolution {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_rows: usize,
}

impl Default for DnsResolution {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 2,
            max_rows: 25,
        }
    }
}

impl Args {
    /// Create query arguments with the defaults set
    pub fn new(query: impl Into<String>, ifaces: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ifaces: ifaces.into(),
            ..Self::default()
        }
    }

    /// Validate the arguments and produce an executable statement
    pub fn prepare(&self) -> Result<Statement> {
        let format = if self.format.is_empty() {
            "txt".to_string()
        } else {
            self.format.clone()
        };
        if !PERMITTED_FORMATS.contains(&format.as_str()) {
            return Err(ProbeError::Query(format!(
                "unknown output format '{}'",
                format
            )));
        }

        let sort_by: SortBy = if self.sort_by.is_empty() {
            SortBy::Packets
        } else {
            self.sort_by.parse()?
        };

        let (attributes, mut label_selector) = parse_query_type(&self.query)?;

        let (ifaces, any_iface) = parse_ifaces(&self.ifaces)?;

        // queries spanning several interfaces report the interface per row
        // even when it was not requested explicitly
        if (any_iface || ifaces.len() > 1) && !label_selector.iface {
            label_selector.iface = true;
        }

        let (first, last) = time::parse_time_range(&self.first, &self.last)?;

        let direction = match (self.sum, self.r#in, self.out) {
            (true, _, _) => Direction::Sum,
            (false, true, false) => Direction::In,
            (false, false, true) => Direction::Out,
            _ => Direction::Both,
        };

        if self.dns_resolution.enabled {
            if self.dns_resolution.timeout_secs == 0 {
                return Err(ProbeError::Query(
                    "resolve-timeout must be greater than 0".into(),
                ));
            }
            if self.dns_resolution.max_rows == 0 {
                return Err(ProbeError::Query(
                    "resolve-rows must be greater than 0".into(),
                ));
            }
        }

        let condition = conditions::parse_condition(&self.condition)?;

        if !(1..=100).contains(&self.max_mem_pct) {
            return Err(ProbeError::Query(format!(
                "invalid memory percentage of '{}' provided",
                self.max_mem_pct
            )));
        }
        if self.num_results == 0 {
            return Err(ProbeError::Query(
                "the printed row limit must be greater than 0".into(),
            ));
        }

        if self.live && last != crate::MAX_TIME {
            return Err(ProbeError::Query(
                "live query not possible if query has last timestamp".into(),
            ));
        }

        let mut stmt = Statement {
            query_type: self.query.clone(),
            attributes,
            label_selector,
            ifaces,
            any_iface,
            condition,
            direction,
            first,
            last,
            sort_by,
            sort_ascending: self.sort_ascending,
            num_results: self.num_results,
            max_mem_pct: self.max_mem_pct,
            low_mem: self.low_mem,
            format,
            caller: self.caller.clone(),
            live: self.live,
        };

        // time queries are reported as a complete ascending timeline
        if stmt.label_selector.timestamp {
            stmt.sort_by = SortBy::Time;
            stmt.sort_ascending = true;
            stmt.num_results = MAX_RESULTS;
        }

        Ok(stmt)
    }
}

/// A validated, executable query statement
#[derive(Debug, Clone)]
pub struct Statement {
    pub query_type: String,
    pub attributes: Vec<Attribute>,
    pub label_selector: LabelSelector,
    pub ifaces: Vec<String>,
    pub any_iface: bool,
    pub condition: Option<Node>,
    pub direction: Direction,
    pub first: Timestamp,
    pub last: Timestamp,
    pub sort_by: SortBy,
    pub sort_ascending: bool,
    pub num_results: u64,
    pub max_mem_pct: usize,
    pub low_mem: bool,
    pub format: String,
    pub caller: String,
    pub live: bool,
}

impl Statement {
    /// The sort specification used during finalization
    pub fn sort_order(&self) -> SortOrder {
        SortOrder {
            sort_by: self.sort_by,
            direction: self.direction,
            ascending: self.sort_ascending,
        }
    }
}

fn parse_ifaces(spec: &str) -> Result<(Vec<String>, bool)> {
    if spec.trim().is_empty() {
        return Err(ProbeError::Query("interface list is empty".into()));
    }

    let mut ifaces = Vec::new();
    let mut any = false;
    for name in spec.split(',') {
        let name = name.trim();
        if name == "any" {
            any = true;
            continue;
        }
        validate_iface_name(name).map_err(|e| ProbeError::Query(e.to_string()))?;
        if !ifaces.iter().any(|existing| existing == name) {
            ifaces.push(name.to_string());
        }
    }
    Ok((ifaces, any))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_defaults() {
        let args = Args::new("sip,dip", "eth0");
        let stmt = args.prepare().unwrap();

        assert_eq!(stmt.attributes.len(), 2);
        assert_eq!(stmt.ifaces, vec!["eth0"]);
        assert!(!stmt.any_iface);
        assert_eq!(stmt.direction, Direction::Both);
        assert_eq!(stmt.sort_by, SortBy::Packets);
        assert_eq!(stmt.num_results, DEFAULT_NUM_RESULTS);
        assert!(stmt.condition.is_none());
        assert!(!stmt.label_selector.iface);
    }

    #[test]
    fn test_direction_derivation() {
        let mut args = Args::new("sip", "eth0");
        args.sum = true;
        assert_eq!(args.prepare().unwrap().direction, Direction::Sum);

        let mut args = Args::new("sip", "eth0");
        args.r#in = true;
        assert_eq!(args.prepare().unwrap().direction, Direction::In);

        let mut args = Args::new("sip", "eth0");
        args.out = true;
        assert_eq!(args.prepare().unwrap().direction, Direction::Out);

        let mut args = Args::new("sip", "eth0");
        args.r#in = true;
        args.out = true;
        assert_eq!(args.prepare().unwrap().direction, Direction::Both);
    }

    #[test]
    fn test_time_query_overrides() {
        let mut args = Args::new("time", "eth0");
        args.num_results = 5;
        let stmt = args.prepare().unwrap();
        assert_eq!(stmt.sort_by, SortBy::Time);
        assert!(stmt.sort_ascending);
        assert_eq!(stmt.num_results, MAX_RESULTS);
    }

    #[test]
    fn test_iface_label_autoselect() {
        let args = Args::new("sip", "eth0,eth1");
        assert!(args.prepare().unwrap().label_selector.iface);

        let args = Args::new("sip", "any");
        let stmt = args.prepare().unwrap();
        assert!(stmt.any_iface);
        assert!(stmt.label_selector.iface);
    }

    #[test]
    fn test_validation_failures() {
        assert!(Args::new("sip", "").prepare().is_err());
        assert!(Args::new("nope", "eth0").prepare().is_err());
        assert!(Args::new("sip", "eth/0").prepare().is_err());

        let mut args = Args::new("sip", "eth0");
        args.format = "xml".into();
        assert!(args.prepare().is_err());

        let mut args = Args::new("sip", "eth0");
        args.sort_by = "flows".into();
        assert!(args.prepare().is_err());

        let mut args = Args::new("sip", "eth0");
        args.num_results = 0;
        assert!(args.prepare().is_err());

        let mut args = Args::new("sip", "eth0");
        args.max_mem_pct = 0;
        assert!(args.prepare().is_err());

        let mut args = Args::new("sip", "eth0");
        args.condition = "proto =".into();
        assert!(matches!(
            args.prepare(),
            Err(ProbeError::MalformedCondition(_))
        ));

        let mut args = Args::new("sip", "eth0");
        args.live = true;
        args.last = "1000000".into();
        args.first = "0".into();
        assert!(args.prepare().is_err());
    }

    #[test]
    fn test_args_serde_surface() {
        let json = r#"{
            "query": "sip,dip",
            "ifaces": "eth0",
            "condition": "proto = TCP",
            "in": true,
            "first": "1000",
            "last": "2000",
            "num_results": 50,
            "sort_by": "bytes",
            "low_mem": true
        }"#;
        let args: Args = serde_json::from_str(json).unwrap();
        assert!(args.r#in);
        assert!(args.low_mem);
        assert_eq!(args.num_results, 50);

        let stmt = args.prepare().unwrap();
        assert_eq!(stmt.direction, Direction::In);
        assert_eq!(stmt.sort_by, SortBy::Bytes);
        assert_eq!((stmt.first, stmt.last), (1000, 2000));
        assert!(stmt.condition.is_some());
    }
}
