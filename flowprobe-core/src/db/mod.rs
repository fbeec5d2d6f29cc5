//! On-disk database layout
//!
//! `DB/<iface>/<day-epoch>/<column>.gpf` plus sidecars and a per-day
//! `meta.json`; one directory per interface per UTC day.

pub mod metadata;
pub mod writer;

pub use metadata::{BlockMetadata, Metadata};
pub use writer::{DbWriter, InterfaceSummaryUpdate};

use crate::{ProbeError, Result, Timestamp};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Seconds per day; day directories are named by UTC-floored epochs
pub const EPOCH_DAY: Timestamp = 86_400;

/// Name of the query log written at the DB root
pub const QUERY_LOG_FILE: &str = "query.log";

/// Name of the per-day metadata file
pub const METADATA_FILE_NAME: &str = "meta.json";

/// Name of the advisory write-lock file at the DB root
pub const LOCK_FILE_NAME: &str = ".flowprobe.lock";

/// Number of attribute columns (the remaining four are counters)
pub const ATTRIBUTE_COL_COUNT: usize = 4;

/// Total number of columns per day directory
pub const COLUMN_COUNT: usize = 8;

/// Stable column file names, attributes first
pub const COLUMN_FILE_NAMES: [&str; COLUMN_COUNT] = [
    "sip",
    "dip",
    "dport",
    "proto",
    "bytes_rcvd",
    "bytes_sent",
    "pkts_rcvd",
    "pkts_sent",
];

pub const SIP_COL: usize = 0;
pub const DIP_COL: usize = 1;
pub const DPORT_COL: usize = 2;
pub const PROTO_COL: usize = 3;
pub const BYTES_RCVD_COL: usize = 4;
pub const BYTES_SENT_COL: usize = 5;
pub const PKTS_RCVD_COL: usize = 6;
pub const PKTS_SENT_COL: usize = 7;

/// Timestamp rounded down to the nearest UTC day
pub fn day_timestamp(timestamp: Timestamp) -> Timestamp {
    timestamp.div_euclid(EPOCH_DAY) * EPOCH_DAY
}

/// Directory holding one interface-day
pub fn daily_dir(db_path: &Path, iface: &str, timestamp: Timestamp) -> PathBuf {
    db_path
        .join(iface)
        .join(day_timestamp(timestamp).to_string())
}

/// Path of one column file within a day directory
pub fn column_path(day_dir: &Path, column: &str) -> PathBuf {
    day_dir.join(format!("{}.gpf", column))
}

/// Advisory lock guarding a DB root against a second concurrent writer.
///
/// The lock file holds the owning pid and is removed on drop; while it exists
/// any further [`DbLock::acquire`] against the same root fails.
#[derive(Debug)]
pub struct DbLock {
    path: PathBuf,
}

impl DbLock {
    /// Acquire the write lock for a DB root, creating the root if needed
    pub fn acquire(db_path: &Path) -> Result<Self> {
        fs::create_dir_all(db_path)?;
        let path = db_path.join(LOCK_FILE_NAME);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    ProbeError::Config(format!(
                        "database {} is locked by another writer ({})",
                        db_path.display(),
                        path.display()
                    ))
                } else {
                    ProbeError::Io(e)
                }
            })?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { path })
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Touch the query log marker at the DB root (world-writable for tooling)
pub fn ensure_query_log(db_path: &Path) -> Result<()> {
    let path = db_path.join(QUERY_LOG_FILE);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666))?;
    }
    Ok(())
}

/// Create a day directory with the expected permissions
pub fn create_daily_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_day_timestamp() {
        assert_eq!(day_timestamp(0), 0);
        assert_eq!(day_timestamp(86_399), 0);
        assert_eq!(day_timestamp(86_400), 86_400);
        assert_eq!(day_timestamp(1_000_000), 950_400);
    }

    #[test]
    fn test_daily_dir_layout() {
        let dir = daily_dir(Path::new("/var/lib/flowprobe/db"), "eth0", 1_000_000);
        assert_eq!(
            dir,
            PathBuf::from("/var/lib/flowprobe/db/eth0/950400")
        );
    }

    #[test]
    fn test_db_lock_exclusive() {
        let dir = TempDir::new().unwrap();

        let lock = DbLock::acquire(dir.path()).unwrap();
        let second = DbLock::acquire(dir.path());
        assert!(matches!(second, Err(ProbeError::Config(_))));

        drop(lock);
        let third = DbLock::acquire(dir.path()).unwrap();
        drop(third);
    }
}
