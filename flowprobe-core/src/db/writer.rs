//! DB writer - persists rotated flow maps as per-day column blocks

use super::metadata::{self, BlockMetadata, Metadata};
use super::{
    column_path, create_daily_dir, daily_dir, day_timestamp, ensure_query_log,
    BYTES_RCVD_COL, BYTES_SENT_COL, COLUMN_COUNT, COLUMN_FILE_NAMES, DIP_COL,
    DPORT_COL, METADATA_FILE_NAME, PKTS_RCVD_COL, PKTS_SENT_COL, PROTO_COL,
    SIP_COL,
};
use crate::encoder::{bitpack, EncoderType};
use crate::flowmap::FlowMap;
use crate::gpfile::GPFile;
use crate::{Result, Timestamp};
use std::path::PathBuf;
use tracing::debug;

/// Summary of one interval written for one interface
#[derive(Debug, Clone, Default)]
pub struct InterfaceSummaryUpdate {
    pub iface: String,
    pub timestamp: Timestamp,
    pub flow_count: u64,
    pub traffic: u64,
}

/// Writes rotated flow maps into the per-day column database of one interface
pub struct DbWriter {
    db_path: PathBuf,
    iface: String,

    day_timestamp: Timestamp,
    encoder_type: EncoderType,

    metadata: Option<Metadata>,
}

impl DbWriter {
    /// Create a writer for one interface
    pub fn new(
        db_path: impl Into<PathBuf>,
        iface: impl Into<String>,
        encoder_type: EncoderType,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            iface: iface.into(),
            day_timestamp: 0,
            encoder_type,
            metadata: None,
        }
    }

    /// The interface this writer serves
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Write one interval's flow map.
    ///
    /// The eight column appends plus the metadata update form one logical
    /// transaction: on any failure the interval is considered lost, and any
    /// partial column appends are skipped by readers because the per-day
    /// metadata never records the interval.
    pub fn write(
        &mut self,
        flowmap: &FlowMap,
        mut meta: BlockMetadata,
        timestamp: Timestamp,
    ) -> Result<InterfaceSummaryUpdate> {
        let dir = daily_dir(&self.db_path, &self.iface, timestamp);
        create_daily_dir(&dir)?;
        ensure_query_log(&self.db_path)?;

        let (columns, update) = column_data(&self.iface, timestamp, flowmap);

        for (name, data) in COLUMN_FILE_NAMES.iter().zip(columns.iter()) {
            let mut gpf = GPFile::open_write(column_path(&dir, name), self.encoder_type)?;
            gpf.write_block(timestamp, data)?;
        }

        meta.timestamp = timestamp;
        meta.flow_count = update.flow_count;
        meta.traffic = update.traffic;
        self.write_metadata(timestamp, meta)?;

        debug!(
            iface = %self.iface,
            timestamp,
            flows = update.flow_count,
            traffic = update.traffic,
            "wrote interval"
        );

        Ok(update)
    }

    fn write_metadata(&mut self, timestamp: Timestamp, meta: BlockMetadata) -> Result<()> {
        if self.day_timestamp != day_timestamp(timestamp) {
            self.metadata = None;
            self.day_timestamp = day_timestamp(timestamp);
        }

        let path = daily_dir(&self.db_path, &self.iface, timestamp).join(METADATA_FILE_NAME);

        let metadata = self
            .metadata
            .get_or_insert_with(|| metadata::try_read_metadata(&path));
        metadata.blocks.push(meta);

        metadata::write_metadata(&path, metadata)
    }
}

/// Decompose a flow map into the eight column byte streams.
///
/// Attribute columns carry the sorted per-row values back to back (v4 rows
/// first, then v6); counter columns are bit-packed. The v4 row count rides as
/// an 8-byte big-endian prefix on the `bytes_rcvd` payload.
fn column_data(
    iface: &str,
    timestamp: Timestamp,
    flowmap: &FlowMap,
) -> ([Vec<u8>; COLUMN_COUNT], InterfaceSummaryUpdate) {
    let (v4_list, v6_list) = flowmap.flatten();
    let total = v4_list.len() + v6_list.len();

    let mut columns: [Vec<u8>; COLUMN_COUNT] = Default::default();
    columns[SIP_COL] = Vec::with_capacity(4 * v4_list.len() + 16 * v6_list.len());
    columns[DIP_COL] = Vec::with_capacity(4 * v4_list.len() + 16 * v6_list.len());
    columns[DPORT_COL] = Vec::with_capacity(2 * total);
    columns[PROTO_COL] = Vec::with_capacity(total);

    let mut update = InterfaceSummaryUpdate {
        iface: iface.to_string(),
        timestamp,
        ..InterfaceSummaryUpdate::default()
    };

    let mut bytes_rcvd = Vec::with_capacity(total);
    let mut bytes_sent = Vec::with_capacity(total);
    let mut pkts_rcvd = Vec::with_capacity(total);
    let mut pkts_sent = Vec::with_capacity(total);

    macro_rules! append_rows {
        ($list:expr) => {
            for entry in &$list {
                update.flow_count += 1;
                update.traffic += entry.val.bytes_rcvd;
                update.traffic += entry.val.bytes_sent;

                bytes_rcvd.push(entry.val.bytes_rcvd);
                bytes_sent.push(entry.val.bytes_sent);
                pkts_rcvd.push(entry.val.pkts_rcvd);
                pkts_sent.push(entry.val.pkts_sent);

                columns[SIP_COL].extend_from_slice(&entry.key.sip);
                columns[DIP_COL].extend_from_slice(&entry.key.dip);
                columns[DPORT_COL].extend_from_slice(&entry.key.dport);
                columns[PROTO_COL].push(entry.key.proto);
            }
        };
    }
    append_rows!(v4_list);
    append_rows!(v6_list);

    columns[BYTES_RCVD_COL] = bitpack::pack(&bytes_rcvd);
    columns[BYTES_SENT_COL] = bitpack::pack(&bytes_sent);
    columns[PKTS_RCVD_COL] = bitpack::pack(&pkts_rcvd);
    columns[PKTS_SENT_COL] = bitpack::pack(&pkts_sent);

    // v4/v6 partition marker carried in-band for format compatibility
    let mut prefixed =
        Vec::with_capacity(8 + columns[BYTES_RCVD_COL].len());
    prefixed.extend_from_slice(&(v4_list.len() as u64).to_be_bytes());
    prefixed.extend_from_slice(&columns[BYTES_RCVD_COL]);
    columns[BYTES_RCVD_COL] = prefixed;

    debug_assert_eq!(columns[PROTO_COL].len(), total);

    (columns, update)
}
