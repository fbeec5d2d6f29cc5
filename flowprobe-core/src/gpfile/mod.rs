//! GPFile - append-only single-column block file
//!
//! A `.gpf` file is the raw concatenation of compressed block payloads in
//! insertion order; there is no in-file framing or magic. The JSON sidecar
//! (`<file>.gpf.meta`) is authoritative: it maps one interval timestamp to
//! one block record `{offset, len, raw_len, encoder_type, timestamp}` and
//! tracks the running append offset.

mod mem_file;

use crate::encoder::{new_encoder, Encoder, EncoderType};
use crate::{ProbeError, Result, Timestamp};
use mem_file::MemFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Suffix of the sidecar header file
pub const HEADER_SUFFIX: &str = ".meta";

/// Current sidecar header version
pub const HEADER_VERSION: u32 = 1;

/// Access mode of an open GPFile; mixing read and write on one handle is not
/// permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Metadata of a single block within a column file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub offset: i64,
    pub len: u64,
    pub raw_len: u64,
    pub encoder_type: EncoderType,
    pub timestamp: Timestamp,
}

impl Block {
    /// True if the block carries no payload (only an offset stamp)
    pub fn is_empty(&self) -> bool {
        self.raw_len == 0
    }
}

/// Sidecar header of a column file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub current_offset: i64,
    pub blocks: BTreeMap<Timestamp, Block>,
}

impl BlockHeader {
    fn new() -> Self {
        Self {
            version: HEADER_VERSION,
            current_offset: 0,
            blocks: BTreeMap::new(),
        }
    }

    /// Blocks in physical (insertion/offset) order
    pub fn ordered_blocks(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> = self.blocks.values().copied().collect();
        blocks.sort_by_key(|b| (b.offset, b.timestamp));
        blocks
    }
}

/// Options governing how a GPFile is opened
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Encoder used for new blocks (read path: per-block tags win)
    pub encoder: EncoderType,
    /// Buffer the whole file in memory on the first read
    pub buffered_reads: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            encoder: EncoderType::default(),
            buffered_reads: false,
        }
    }
}

/// Single-column block file
pub struct GPFile {
    filename: PathBuf,
    file: Option<File>,
    header: BlockHeader,
    // last seek position for optimized sequential reads
    last_seek_pos: i64,
    default_encoder: Box<dyn Encoder>,
    access_mode: AccessMode,
    buffered_reads: bool,
    buffer: Option<MemFile>,
}

impl GPFile {
    /// Open a column file in the given mode.
    ///
    /// In write mode a missing sidecar initializes a fresh header; in read
    /// mode a missing or unreadable sidecar renders the file invalid.
    pub fn open(
        filename: impl Into<PathBuf>,
        access_mode: AccessMode,
        options: Options,
    ) -> Result<Self> {
        let filename = filename.into();
        let header = Self::read_header(&filename, access_mode)?;

        Ok(Self {
            filename,
            file: None,
            header,
            last_seek_pos: 0,
            default_encoder: new_encoder(options.encoder),
            access_mode,
            buffered_reads: options.buffered_reads,
            buffer: None,
        })
    }

    /// Open for reading with default options
    pub fn open_read(filename: impl Into<PathBuf>) -> Result<Self> {
        Self::open(filename, AccessMode::Read, Options::default())
    }

    /// Open for appending with the given block encoder
    pub fn open_write(filename: impl Into<PathBuf>, encoder: EncoderType) -> Result<Self> {
        Self::open(
            filename,
            AccessMode::Write,
            Options {
                encoder,
                ..Options::default()
            },
        )
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.filename
    }

    /// The block map and append state of this file
    pub fn blocks(&self) -> &BlockHeader {
        &self.header
    }

    /// Write the block for a given timestamp.
    ///
    /// Empty payloads only stamp the header so downstream tools see a gapless
    /// timeline. Non-empty payloads are compressed, appended and fsynced
    /// before the header is rewritten; a header failure after the append is
    /// reported as [`ProbeError::HeaderWrite`] since index and data would
    /// otherwise silently diverge.
    pub fn write_block(&mut self, timestamp: Timestamp, data: &[u8]) -> Result<()> {
        if self.access_mode != AccessMode::Write {
            return Err(ProbeError::Access(format!(
                "cannot write to {} in read mode",
                self.filename.display()
            )));
        }
        if self.header.blocks.contains_key(&timestamp) {
            return Err(ProbeError::InvalidFormat(format!(
                "{}: block for timestamp {} already exists",
                self.filename.display(),
                timestamp
            )));
        }

        if data.is_empty() {
            self.header.blocks.insert(
                timestamp,
                Block {
                    offset: self.header.current_offset,
                    len: 0,
                    raw_len: 0,
                    encoder_type: self.default_encoder.kind(),
                    timestamp,
                },
            );
            return self.write_header().map_err(ProbeError::Io);
        }

        if self.file.is_none() {
            self.file = Some(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&self.filename)?,
            );
        }
        let file = self.file.as_mut().unwrap();

        let written = self.default_encoder.compress(data, file)?;
        file.sync_all()?;

        self.header.blocks.insert(
            timestamp,
            Block {
                offset: self.header.current_offset,
                len: written as u64,
                raw_len: data.len() as u64,
                encoder_type: self.default_encoder.kind(),
                timestamp,
            },
        );
        self.header.current_offset += written as i64;

        self.write_header().map_err(|e| {
            ProbeError::HeaderWrite(format!("{}: {}", self.filename.display(), e))
        })
    }

    /// Read and decompress the block for a given timestamp.
    ///
    /// Sequential reads of ascending timestamps degrade into pure streaming
    /// since no seek is issued when the tracked offset already matches.
    pub fn read_block(&mut self, timestamp: Timestamp) -> Result<Vec<u8>> {
        if self.access_mode != AccessMode::Read {
            return Err(ProbeError::Access(format!(
                "cannot read from {} in write mode",
                self.filename.display()
            )));
        }

        let block = *self.header.blocks.get(&timestamp).ok_or_else(|| {
            ProbeError::InvalidFormat(format!(
                "{}: no block for timestamp {}",
                self.filename.display(),
                timestamp
            ))
        })?;

        if block.is_empty() {
            return Ok(Vec::new());
        }

        let encoder = if block.encoder_type == self.default_encoder.kind() {
            None
        } else {
            Some(new_encoder(block.encoder_type))
        };
        let encoder = encoder.as_deref().unwrap_or(self.default_encoder.as_ref());

        if self.buffered_reads {
            if self.buffer.is_none() {
                let buffer = MemFile::load(&self.filename)?;
                if buffer.len() as i64 != self.header.current_offset {
                    return Err(ProbeError::CorruptBlock(format!(
                        "{}: file size {} does not match header offset {}",
                        self.filename.display(),
                        buffer.len(),
                        self.header.current_offset
                    )));
                }
                self.buffer = Some(buffer);
            }
            let compressed = self
                .buffer
                .as_ref()
                .unwrap()
                .slice(block.offset as usize, block.len as usize)?;
            return encoder.decompress(block.raw_len as usize, compressed);
        }

        if self.file.is_none() {
            self.file = Some(File::open(&self.filename)?);
        }
        let file = self.file.as_mut().unwrap();

        if block.offset != self.last_seek_pos {
            self.last_seek_pos = file.seek(SeekFrom::Start(block.offset as u64))? as i64;
        }

        let mut compressed = vec![0u8; block.len as usize];
        file.read_exact(&mut compressed)?;
        self.last_seek_pos += block.len as i64;

        encoder.decompress(block.raw_len as usize, &compressed)
    }

    /// Check that the physical file size matches the header's append offset
    pub fn validate(&self) -> Result<()> {
        let size = match fs::metadata(&self.filename) {
            Ok(meta) => meta.len() as i64,
            // a file holding only empty blocks is never created
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size != self.header.current_offset {
            return Err(ProbeError::CorruptBlock(format!(
                "{}: file size {} does not match header offset {}",
                self.filename.display(),
                size,
                self.header.current_offset
            )));
        }
        Ok(())
    }

    /// Check each non-empty block's leading bytes against its declared
    /// encoder's frame magic, returning the timestamps that mismatch
    pub fn verify_magic(&self) -> Result<Vec<Timestamp>> {
        let mut mismatched = Vec::new();
        let mut file = match File::open(&self.filename) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(mismatched),
            Err(e) => return Err(e.into()),
        };

        for block in self.header.ordered_blocks() {
            if block.is_empty() || block.len < 4 {
                continue;
            }
            let Some(magic) = block.encoder_type.frame_magic() else {
                continue;
            };
            file.seek(SeekFrom::Start(block.offset as u64))?;
            let mut lead = [0u8; 4];
            file.read_exact(&mut lead)?;
            if lead != magic {
                mismatched.push(block.timestamp);
            }
        }
        Ok(mismatched)
    }

    /// Remove the data file and its sidecar
    pub fn delete(self) -> Result<()> {
        drop(self.file);
        match fs::remove_file(&self.filename) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::remove_file(header_path(&self.filename))?;
        Ok(())
    }

    fn read_header(filename: &Path, access_mode: AccessMode) -> Result<BlockHeader> {
        let path = header_path(filename);
        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(header) => Ok(header),
                Err(e) => match access_mode {
                    // an unreadable sidecar invalidates the whole file
                    AccessMode::Read => Err(ProbeError::MissingHeader(format!(
                        "{}: {}",
                        path.display(),
                        e
                    ))),
                    AccessMode::Write => Err(ProbeError::InvalidFormat(format!(
                        "{}: {}",
                        path.display(),
                        e
                    ))),
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match access_mode {
                AccessMode::Read => {
                    Err(ProbeError::MissingHeader(path.display().to_string()))
                }
                AccessMode::Write => Ok(BlockHeader::new()),
            },
            Err(e) => Err(e.into()),
        }
    }

    // Atomic header rewrite: write-temp, fsync, rename.
    fn write_header(&self) -> std::io::Result<()> {
        let path = header_path(&self.filename);
        let tmp = path.with_extension("meta.tmp");

        let data = serde_json::to_vec(&self.header)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = File::create(&tmp)?;
        std::io::Write::write_all(&mut file, &data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)
    }
}

/// Sidecar path for a column file
pub fn header_path(filename: &Path) -> PathBuf {
    let mut path = filename.as_os_str().to_os_string();
    path.push(HEADER_SUFFIX);
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::LZ4_FRAME_MAGIC;
    use tempfile::TempDir;

    fn payload(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add((i % 64) as u8)).collect()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();

        let blocks = vec![
            (1_000_000i64, payload(1, 512)),
            (1_000_300, payload(2, 2048)),
            (1_000_600, Vec::new()),
            (1_000_900, payload(3, 64)),
        ];

        for kind in [EncoderType::None, EncoderType::Lz4, EncoderType::Zstd] {
            let path = dir.path().join(format!("sip_{}.gpf", kind));
            {
                let mut gpf = GPFile::open_write(&path, kind).unwrap();
                for (ts, data) in &blocks {
                    gpf.write_block(*ts, data).unwrap();
                }
                gpf.validate().unwrap();
            }

            let mut gpf = GPFile::open_read(&path).unwrap();
            for (ts, data) in &blocks {
                assert_eq!(gpf.read_block(*ts).unwrap(), *data, "encoder {}", kind);
            }
        }
    }

    #[test]
    fn test_sequential_then_random_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dip.gpf");

        let mut gpf = GPFile::open_write(&path, EncoderType::Lz4).unwrap();
        for i in 0..10i64 {
            gpf.write_block(i * 300, &payload(i as u8, 300)).unwrap();
        }
        drop(gpf);

        let mut gpf = GPFile::open_read(&path).unwrap();
        // ascending order exercises the streaming path
        for i in 0..10i64 {
            assert_eq!(gpf.read_block(i * 300).unwrap(), payload(i as u8, 300));
        }
        // backwards forces a seek
        assert_eq!(gpf.read_block(0).unwrap(), payload(0, 300));
        assert_eq!(gpf.read_block(2700).unwrap(), payload(9, 300));
    }

    #[test]
    fn test_buffered_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proto.gpf");

        let mut gpf = GPFile::open_write(&path, EncoderType::Zstd).unwrap();
        gpf.write_block(100, &payload(7, 1000)).unwrap();
        gpf.write_block(200, &payload(8, 1000)).unwrap();
        drop(gpf);

        let mut gpf = GPFile::open(
            &path,
            AccessMode::Read,
            Options {
                buffered_reads: true,
                ..Options::default()
            },
        )
        .unwrap();
        assert_eq!(gpf.read_block(200).unwrap(), payload(8, 1000));
        assert_eq!(gpf.read_block(100).unwrap(), payload(7, 1000));
    }

    #[test]
    fn test_mode_mixing_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dport.gpf");

        let mut writer = GPFile::open_write(&path, EncoderType::None).unwrap();
        writer.write_block(100, &payload(0, 16)).unwrap();
        assert!(matches!(
            writer.read_block(100),
            Err(ProbeError::Access(_))
        ));
        drop(writer);

        let mut reader = GPFile::open_read(&path).unwrap();
        assert!(matches!(
            reader.write_block(200, &payload(0, 16)),
            Err(ProbeError::Access(_))
        ));
    }

    #[test]
    fn test_missing_header_read_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bytes_rcvd.gpf");
        fs::write(&path, b"some stray data").unwrap();

        assert!(matches!(
            GPFile::open_read(&path),
            Err(ProbeError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_truncated_header_read_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bytes_sent.gpf");

        let mut gpf = GPFile::open_write(&path, EncoderType::Lz4).unwrap();
        gpf.write_block(100, &payload(1, 128)).unwrap();
        drop(gpf);

        // truncate the sidecar mid-JSON
        let hdr = header_path(&path);
        let data = fs::read(&hdr).unwrap();
        fs::write(&hdr, &data[..data.len() / 2]).unwrap();

        assert!(matches!(
            GPFile::open_read(&path),
            Err(ProbeError::MissingHeader(_))
        ));
    }

    #[test]
    fn test_offset_accounting_and_empty_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pkts_rcvd.gpf");

        let mut gpf = GPFile::open_write(&path, EncoderType::None).unwrap();
        gpf.write_block(100, &payload(1, 100)).unwrap();
        gpf.write_block(200, &[]).unwrap();
        gpf.write_block(300, &payload(2, 50)).unwrap();
        gpf.write_block(400, &[]).unwrap();

        let header = gpf.blocks();
        assert_eq!(header.current_offset, 150);
        assert_eq!(header.blocks.len(), 4);
        assert_eq!(header.blocks[&200].offset, 100);
        assert!(header.blocks[&200].is_empty());
        // trailing empty block contributes no bytes
        assert_eq!(header.blocks[&400].offset, 150);
        gpf.validate().unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 150);
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pkts_sent.gpf");

        let mut gpf = GPFile::open_write(&path, EncoderType::None).unwrap();
        gpf.write_block(100, &payload(1, 10)).unwrap();
        assert!(gpf.write_block(100, &payload(2, 10)).is_err());
    }

    #[test]
    fn test_verify_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sip.gpf");

        let mut gpf = GPFile::open_write(&path, EncoderType::Lz4).unwrap();
        gpf.write_block(100, &payload(1, 256)).unwrap();
        gpf.write_block(200, &payload(2, 256)).unwrap();
        let first_block = gpf.blocks().blocks[&100];
        drop(gpf);

        let gpf = GPFile::open_read(&path).unwrap();
        assert!(gpf.verify_magic().unwrap().is_empty());

        // clobber the first block's magic
        use std::io::Write;
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(first_block.offset as u64)).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        drop(file);

        assert_eq!(gpf.verify_magic().unwrap(), vec![100]);
        assert_eq!(&LZ4_FRAME_MAGIC, &[0x04, 0x22, 0x4D, 0x18]);
    }

    #[test]
    fn test_persistent_append_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dip.gpf");

        {
            let mut gpf = GPFile::open_write(&path, EncoderType::Zstd).unwrap();
            gpf.write_block(100, &payload(1, 100)).unwrap();
        }
        {
            let mut gpf = GPFile::open_write(&path, EncoderType::Zstd).unwrap();
            gpf.write_block(400, &payload(2, 100)).unwrap();
            gpf.validate().unwrap();
        }

        let mut gpf = GPFile::open_read(&path).unwrap();
        assert_eq!(gpf.read_block(100).unwrap(), payload(1, 100));
        assert_eq!(gpf.read_block(400).unwrap(), payload(2, 100));
    }
}
