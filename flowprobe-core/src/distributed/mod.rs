//! Distributed query fan-out
//!
//! Executes one query against many hosts through a three-stage pipeline
//! (`prepare → run → aggregate`) connected by bounded channels. A bounded
//! worker pool runs the per-host queries; a single aggregator merges rows by
//! their projected key, unions interface sets, deducts merged-row overlap
//! from the total hit count and records per-host statuses. Host failures
//! degrade the result, they never fail the whole query.

use crate::query::{Args, QueryResult, Runner, RowsMap, Status, Summary};
use crate::{CancelToken, ProbeError, Result};
use crossbeam_channel::{bounded, Receiver};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Expands a host selector into a concrete host list
pub trait Resolver: Send + Sync {
    fn resolve(&self, selector: &str) -> Result<Vec<String>>;
}

/// Identity resolver: the selector is already a comma-separated host list
pub struct StaticResolver;

impl Resolver for StaticResolver {
    fn resolve(&self, selector: &str) -> Result<Vec<String>> {
        let hosts: Vec<String> = selector
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err(ProbeError::Query(
                "list of target hosts is empty".into(),
            ));
        }
        Ok(hosts)
    }
}

/// Produces per-host query workloads
pub trait Querier: Send + Sync {
    fn create_workload(&self, host: &str, args: &Args) -> Result<QueryWorkload>;
}

/// An individual workload: one query against one host
pub struct QueryWorkload {
    pub host: String,
    pub runner: Arc<dyn Runner>,
    pub args: Args,
}

/// Distributed query runner
pub struct DistributedRunner {
    resolver: Arc<dyn Resolver>,
    querier: Arc<dyn Querier>,
    max_concurrent: Option<usize>,
}

impl DistributedRunner {
    pub fn new(resolver: Arc<dyn Resolver>, querier: Arc<dyn Querier>) -> Self {
        Self {
            resolver,
            querier,
            max_concurrent: None,
        }
    }

    /// Bound the number of hosts queried concurrently (default: host count)
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n.max(1));
        self
    }

    /// Execute the query against all hosts the selector resolves to
    pub fn run(
        &self,
        token: &CancelToken,
        host_selector: &str,
        args: &Args,
    ) -> Result<QueryResult> {
        // validate the statement once up front; per-host runners re-prepare
        let stmt = args.prepare()?;

        let hosts = self.resolver.resolve(host_selector)?;
        let num_runners = self.max_concurrent.unwrap_or(hosts.len()).max(1);

        info!(hosts = hosts.len(), runners = num_runners, "dispatching queries");

        let responses = self.spawn_pipeline(token, hosts, args, num_runners);
        let mut result = aggregate_results(token, responses);

        // the aggregate is re-sorted and truncated under the original limits
        let rows_map = {
            let mut map = RowsMap::new();
            map.merge_rows(std::mem::take(&mut result.rows));
            map
        };
        let mut rows = rows_map.into_rows_sorted(stmt.sort_order());
        if stmt.sort_by != crate::query::SortBy::Time
            && rows.len() > stmt.num_results as usize
        {
            rows.truncate(stmt.num_results as usize);
        }
        result.summary.hits.displayed = rows.len();
        result.rows = rows;
        result.query = stmt.query_type;

        Ok(result)
    }

    fn spawn_pipeline(
        &self,
        token: &CancelToken,
        hosts: Vec<String>,
        args: &Args,
        num_runners: usize,
    ) -> Receiver<QueryResponse> {
        let (workload_tx, workload_rx) = bounded::<QueryWorkload>(num_runners);
        let (response_tx, response_rx) = bounded::<QueryResponse>(num_runners);

        // stage 1: prepare workloads
        {
            let querier = Arc::clone(&self.querier);
            let args = args.clone();
            let token = token.clone();
            std::thread::spawn(move || {
                for host in hosts {
                    if token.is_cancelled() {
                        break;
                    }
                    match querier.create_workload(&host, &args) {
                        Ok(workload) => {
                            if workload_tx.send(workload).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(host = %host, error = %e, "failed to create workload");
                        }
                    }
                }
            });
        }

        // stage 2: bounded pool of per-host runners
        for _ in 0..num_runners {
            let workload_rx = workload_rx.clone();
            let response_tx = response_tx.clone();
            let token = token.clone();
            std::thread::spawn(move || {
                for workload in workload_rx.iter() {
                    if token.is_cancelled() {
                        return;
                    }
                    let result = workload.runner.run(&token, &workload.args);
                    let response = QueryResponse {
                        host: workload.host,
                        result,
                    };
                    if response_tx.send(response).is_err() {
                        return;
                    }
                }
            });
        }

        response_rx
    }
}

struct QueryResponse {
    host: String,
    result: Result<QueryResult>,
}

// stage 3: fold per-host responses into the final result
fn aggregate_results(token: &CancelToken, responses: Receiver<QueryResponse>) -> QueryResult {
    let mut rows_map = RowsMap::new();
    let mut hosts_statuses: BTreeMap<String, Status> = BTreeMap::new();
    let mut summary = Summary::default();
    let mut interfaces: Vec<String> = Vec::new();
    let mut first_set = false;

    for response in responses.iter() {
        if token.is_cancelled() {
            break;
        }
        let host = response.host;
        match response.result {
            Err(e) => {
                warn!(host = %host, error = %e, "host query failed");
                hosts_statuses.insert(host, Status::error(e.to_string()));
            }
            Ok(result) => {
                for (remote_host, status) in result.hosts_statuses {
                    hosts_statuses.insert(remote_host, status);
                }
                hosts_statuses.insert(host, result.status);

                let merged = rows_map.merge_rows(result.rows);

                for iface in result.summary.interfaces {
                    if !interfaces.contains(&iface) {
                        interfaces.push(iface);
                    }
                }

                if !first_set || result.summary.first < summary.first {
                    summary.first = result.summary.first;
                    first_set = true;
                }
                summary.last = summary.last.max(result.summary.last);
                summary.totals.add(&result.summary.totals);

                // overlapping intervals across hosts produce merged rows;
                // deduct them so hits are not double-counted
                summary.hits.total += result.summary.hits.total.saturating_sub(merged);
            }
        }
    }

    interfaces.sort();
    summary.interfaces = interfaces;

    let status = if rows_map.is_empty() {
        if hosts_statuses
            .values()
            .any(|s| s.code == crate::query::StatusCode::Error)
        {
            Status::partial("one or more hosts failed")
        } else {
            Status::empty()
        }
    } else if hosts_statuses
        .values()
        .any(|s| s.code == crate::query::StatusCode::Error)
    {
        Status::partial("one or more hosts failed")
    } else {
        Status::ok()
    };

    QueryResult {
        rows: rows_map.into_rows_sorted(crate::query::SortOrder {
            sort_by: crate::query::SortBy::Packets,
            direction: crate::Direction::Both,
            ascending: false,
        }),
        summary,
        hosts_statuses,
        query: String::new(),
        status,
    }
}
