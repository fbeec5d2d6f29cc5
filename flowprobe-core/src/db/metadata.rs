//! Per-day metadata
//!
//! `meta.json` is the authoritative index of a day directory: one record per
//! written interval. Readers skip intervals that never made it into the
//! metadata, which is what makes the eight column appends of one interval an
//! all-or-nothing unit from the query engine's point of view.

use crate::{Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Statistics of one written interval.
///
/// The v4 row count of an interval currently travels as a payload prefix on
/// the `bytes_rcvd` column (a compatibility encoding); its preferred future
/// home is a field on this record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub timestamp: Timestamp,
    pub flow_count: u64,
    pub traffic: u64,
    pub packets_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcap_packets_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcap_packets_dropped: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcap_packets_if_dropped: Option<u64>,
}

/// The per-day metadata record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub blocks: Vec<BlockMetadata>,
}

/// Read per-day metadata, falling back to an empty record if the file is
/// missing or unreadable (the writer will regrow it)
pub fn try_read_metadata(path: &Path) -> Metadata {
    read_metadata(path).unwrap_or_default()
}

/// Read per-day metadata
pub fn read_metadata(path: &Path) -> Result<Metadata> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| {
        crate::ProbeError::InvalidFormat(format!("{}: {}", path.display(), e))
    })
}

/// Rewrite per-day metadata atomically (write-temp + rename)
pub fn write_metadata(path: &Path, metadata: &Metadata) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec(metadata)
        .map_err(|e| crate::ProbeError::InvalidFormat(e.to_string()))?;

    let mut file = File::create(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");

        let mut metadata = Metadata::default();
        metadata.blocks.push(BlockMetadata {
            timestamp: 1_000_000,
            flow_count: 42,
            traffic: 123_456,
            packets_dropped: 3,
            ..BlockMetadata::default()
        });
        metadata.blocks.push(BlockMetadata {
            timestamp: 1_000_300,
            flow_count: 7,
            traffic: 999,
            packets_dropped: 0,
            pcap_packets_received: Some(1000),
            ..BlockMetadata::default()
        });

        write_metadata(&path, &metadata).unwrap();
        let restored = read_metadata(&path).unwrap();
        assert_eq!(restored.blocks, metadata.blocks);
    }

    #[test]
    fn test_try_read_tolerates_missing_and_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.json");

        assert!(try_read_metadata(&path).blocks.is_empty());

        fs::write(&path, b"{ not json").unwrap();
        assert!(try_read_metadata(&path).blocks.is_empty());
        assert!(read_metadata(&path).is_err());
    }
}
