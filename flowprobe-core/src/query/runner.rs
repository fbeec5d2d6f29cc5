//! Query runner
//!
//! Scans the column files of each planned interface-day in lock-step,
//! reconstructs rows, applies the condition and folds matches into a
//! [`RowsMap`], then finalizes into an ordered, truncated result.

use super::planner::{self, DayWorkload};
use super::results::{QueryResult, RowKey, RowsMap, SortBy, Status, Summary};
use super::{Args, Runner, Statement};
use crate::conditions::RowView;
use crate::db::{self, BYTES_RCVD_COL, COLUMN_COUNT, COLUMN_FILE_NAMES, DPORT_COL, PROTO_COL};
use crate::encoder::bitpack;
use crate::gpfile::{AccessMode, GPFile, Options};
use crate::{
    raw_ip_to_addr, Attribute, CancelToken, ProbeError, Result, Timestamp, Val, IPV4_WIDTH,
    IPV6_WIDTH,
};
use std::path::PathBuf;
use tracing::warn;

/// Executes queries against one flow database
pub struct QueryRunner {
    db_path: PathBuf,
}

#[derive(Default)]
struct ScanState {
    rows: RowsMap,
    totals: Val,
    first_seen: Option<Timestamp>,
    last_seen: Option<Timestamp>,
    skipped_blocks: usize,
}

impl QueryRunner {
    /// Create a runner over the given DB root
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Prepare the arguments and execute the resulting statement
    pub fn run(&self, token: &CancelToken, args: &Args) -> Result<QueryResult> {
        let stmt = args.prepare()?;
        self.run_statement(token, &stmt)
    }

    /// Execute a prepared statement
    pub fn run_statement(&self, token: &CancelToken, stmt: &Statement) -> Result<QueryResult> {
        let plan = planner::plan(&self.db_path, stmt)?;

        let mut scan = ScanState::default();
        let mut skipped_days = plan.skipped_days;

        for workload in &plan.workloads {
            if token.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            match self.scan_day(token, stmt, workload, &mut scan) {
                Ok(()) => {}
                Err(ProbeError::Cancelled) => return Err(ProbeError::Cancelled),
                Err(e) => {
                    warn!(
                        iface = %workload.iface,
                        day = workload.day,
                        error = %e,
                        "skipping day"
                    );
                    skipped_days += 1;
                }
            }
        }

        let hits_total = scan.rows.len();
        let mut rows = scan.rows.into_rows_sorted(stmt.sort_order());

        // a time query is a complete timeline; everything else is truncated
        if stmt.sort_by != SortBy::Time && rows.len() > stmt.num_results as usize {
            rows.truncate(stmt.num_results as usize);
        }

        let status = if skipped_days > 0 || scan.skipped_blocks > 0 {
            Status::partial(format!(
                "skipped {} blocks and {} days",
                scan.skipped_blocks, skipped_days
            ))
        } else if rows.is_empty() {
            Status::empty()
        } else {
            Status::ok()
        };

        Ok(QueryResult {
            summary: Summary {
                first: scan.first_seen.unwrap_or(0),
                last: scan.last_seen.unwrap_or(0),
                interfaces: plan.ifaces,
                totals: scan.totals,
                hits: super::Hits {
                    total: hits_total,
                    displayed: rows.len(),
                },
            },
            rows,
            hosts_statuses: Default::default(),
            query: stmt.query_type.clone(),
            status,
        })
    }

    fn scan_day(
        &self,
        token: &CancelToken,
        stmt: &Statement,
        workload: &DayWorkload,
        scan: &mut ScanState,
    ) -> Result<()> {
        let options = Options {
            // the low-memory flag streams from the descriptor instead of
            // buffering whole column files
            buffered_reads: !stmt.low_mem,
            ..Options::default()
        };

        let mut files = Vec::with_capacity(COLUMN_COUNT);
        for name in COLUMN_FILE_NAMES {
            files.push(GPFile::open(
                db::column_path(&workload.dir, name),
                AccessMode::Read,
                options,
            )?);
        }

        // a block only exists for the day if every column carries it
        let mut timestamps: Vec<Timestamp> = files[0]
            .blocks()
            .blocks
            .keys()
            .copied()
            .filter(|ts| *ts >= stmt.first && *ts <= stmt.last)
            .collect();
        timestamps.retain(|ts| {
            files[1..]
                .iter()
                .all(|file| file.blocks().blocks.contains_key(ts))
        });

        for ts in timestamps {
            if token.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            match scan_block(stmt, workload, &mut files, ts, scan) {
                Ok(()) => {
                    scan.first_seen = Some(scan.first_seen.map_or(ts, |f| f.min(ts)));
                    scan.last_seen = Some(scan.last_seen.map_or(ts, |l| l.max(ts)));
                }
                Err(e) => {
                    warn!(
                        iface = %workload.iface,
                        timestamp = ts,
                        error = %e,
                        "skipping corrupt block"
                    );
                    scan.skipped_blocks += 1;
                }
            }
        }

        Ok(())
    }
}

fn scan_block(
    stmt: &Statement,
    workload: &DayWorkload,
    files: &mut [GPFile],
    ts: Timestamp,
    scan: &mut ScanState,
) -> Result<()> {
    let mut columns: Vec<Vec<u8>> = Vec::with_capacity(COLUMN_COUNT);
    for file in files.iter_mut() {
        columns.push(file.read_block(ts)?);
    }

    // the v4-count prefix partitions every attribute column into its v4 and
    // v6 segments
    let bytes_rcvd_payload = &columns[BYTES_RCVD_COL];
    if bytes_rcvd_payload.len() < 8 {
        return Err(ProbeError::CorruptBlock(
            "bytes_rcvd block is missing its v4-count prefix".into(),
        ));
    }
    let v4_count = u64::from_be_bytes(bytes_rcvd_payload[..8].try_into().unwrap()) as usize;

    let bytes_rcvd = bitpack::unpack(&bytes_rcvd_payload[8..])?;
    let bytes_sent = bitpack::unpack(&columns[db::BYTES_SENT_COL])?;
    let pkts_rcvd = bitpack::unpack(&columns[db::PKTS_RCVD_COL])?;
    let pkts_sent = bitpack::unpack(&columns[db::PKTS_SENT_COL])?;

    let total = bytes_rcvd.len();
    if bytes_sent.len() != total || pkts_rcvd.len() != total || pkts_sent.len() != total {
        return Err(ProbeError::CorruptBlock(format!(
            "counter column lengths diverge ({}/{}/{}/{})",
            total,
            bytes_sent.len(),
            pkts_rcvd.len(),
            pkts_sent.len()
        )));
    }
    if v4_count > total {
        return Err(ProbeError::CorruptBlock(format!(
            "v4 row count {} exceeds total row count {}",
            v4_count, total
        )));
    }
    let v6_count = total - v4_count;

    let sip_col = &columns[db::SIP_COL];
    let dip_col = &columns[db::DIP_COL];
    let dport_col = &columns[DPORT_COL];
    let proto_col = &columns[PROTO_COL];

    let ip_len = v4_count * IPV4_WIDTH + v6_count * IPV6_WIDTH;
    if sip_col.len() != ip_len
        || dip_col.len() != ip_len
        || dport_col.len() != total * 2
        || proto_col.len() != total
    {
        return Err(ProbeError::CorruptBlock(
            "attribute column lengths do not match row count".into(),
        ));
    }

    for i in 0..total {
        let (sip, dip) = if i < v4_count {
            let off = i * IPV4_WIDTH;
            (
                &sip_col[off..off + IPV4_WIDTH],
                &dip_col[off..off + IPV4_WIDTH],
            )
        } else {
            let off = v4_count * IPV4_WIDTH + (i - v4_count) * IPV6_WIDTH;
            (
                &sip_col[off..off + IPV6_WIDTH],
                &dip_col[off..off + IPV6_WIDTH],
            )
        };
        let dport = u16::from_be_bytes([dport_col[i * 2], dport_col[i * 2 + 1]]);
        let proto = proto_col[i];
        let counters = Val {
            bytes_rcvd: bytes_rcvd[i],
            bytes_sent: bytes_sent[i],
            pkts_rcvd: pkts_rcvd[i],
            pkts_sent: pkts_sent[i],
        };

        let row = RowView {
            sip,
            dip,
            dport,
            proto,
            counters: &counters,
        };
        if let Some(condition) = &stmt.condition {
            if !condition.evaluate(&row) {
                continue;
            }
        }

        let mut key = RowKey::default();
        if stmt.label_selector.timestamp {
            key.timestamp = Some(ts);
        }
        if stmt.label_selector.iface {
            key.iface = Some(workload.iface.clone());
        }
        for attribute in &stmt.attributes {
            match attribute {
                Attribute::Sip => key.sip = raw_ip_to_addr(sip),
                Attribute::Dip => key.dip = raw_ip_to_addr(dip),
                Attribute::Dport => key.dport = Some(dport),
                Attribute::Proto => key.proto = Some(proto),
            }
        }

        let folded = stmt.direction.apply(&counters);
        scan.totals.add(&folded);
        scan.rows.fold(key, folded);
    }

    Ok(())
}

impl Runner for QueryRunner {
    fn run(&self, token: &CancelToken, args: &Args) -> Result<QueryResult> {
        QueryRunner::run(self, token, args)
    }
}
