//! Query planner
//!
//! Resolves the interfaces and day directories a statement touches. A day
//! directory only becomes a workload if its per-day metadata is readable;
//! everything else is reported as skipped and surfaces as a partial result.

use super::Statement;
use crate::db::{self, metadata};
use crate::{Result, Timestamp};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One interface-day to scan
#[derive(Debug, Clone)]
pub struct DayWorkload {
    pub iface: String,
    pub day: Timestamp,
    pub dir: PathBuf,
}

/// The resolved scan plan of one statement
#[derive(Debug, Default)]
pub struct QueryPlan {
    /// Workloads in ascending `(day, iface)` order
    pub workloads: Vec<DayWorkload>,
    /// Interfaces the plan covers (resolved `any` included)
    pub ifaces: Vec<String>,
    /// Interfaces without a database directory
    pub missing_ifaces: Vec<String>,
    /// Days rejected for unreadable per-day metadata
    pub skipped_days: usize,
}

/// Enumerate the interface/day directories falling into the statement's
/// time range
pub fn plan(db_path: &Path, stmt: &Statement) -> Result<QueryPlan> {
    let mut plan = QueryPlan::default();

    let mut ifaces = stmt.ifaces.clone();
    if stmt.any_iface {
        for name in list_ifaces(db_path)? {
            if !ifaces.contains(&name) {
                ifaces.push(name);
            }
        }
    }
    ifaces.sort();

    let first_day = db::day_timestamp(stmt.first);
    let last_day = db::day_timestamp(stmt.last);

    for iface in &ifaces {
        let iface_dir = db_path.join(iface);
        if !iface_dir.is_dir() {
            plan.missing_ifaces.push(iface.clone());
            continue;
        }

        for entry in fs::read_dir(&iface_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(day) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<Timestamp>().ok())
            else {
                continue;
            };
            if day < first_day || day > last_day {
                continue;
            }

            let dir = entry.path();
            if metadata::read_metadata(&dir.join(db::METADATA_FILE_NAME)).is_err() {
                warn!(dir = %dir.display(), "skipping day with unreadable metadata");
                plan.skipped_days += 1;
                continue;
            }

            plan.workloads.push(DayWorkload {
                iface: iface.clone(),
                day,
                dir,
            });
        }
    }

    plan.workloads.sort_by(|a, b| {
        a.day
            .cmp(&b.day)
            .then_with(|| a.iface.cmp(&b.iface))
    });
    plan.ifaces = ifaces;

    Ok(plan)
}

/// All interface directories present in the DB root
pub fn list_ifaces(db_path: &Path) -> Result<Vec<String>> {
    let mut ifaces = Vec::new();
    if !db_path.is_dir() {
        return Ok(ifaces);
    }
    for entry in fs::read_dir(db_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with('.') {
                continue;
            }
            ifaces.push(name.to_string());
        }
    }
    ifaces.sort();
    Ok(ifaces)
}
