//! In-memory buffer for a whole column file
//!
//! The query engine slurps each column file once and serves block reads from
//! memory, unless the low-memory flag routes reads through the descriptor.

use crate::{ProbeError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Whole-file read buffer
pub(crate) struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    /// Read the complete file at `path` into memory
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len() as usize;
        let mut data = Vec::with_capacity(size);
        let n = file.read_to_end(&mut data)?;
        if n != size {
            return Err(ProbeError::InvalidFormat(format!(
                "unexpected number of bytes read (want {}, have {})",
                size, n
            )));
        }
        Ok(Self { data })
    }

    /// Borrow `len` bytes starting at `offset`
    pub(crate) fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.get(offset..offset + len).ok_or_else(|| {
            ProbeError::CorruptBlock(format!(
                "block range {}..{} exceeds file size {}",
                offset,
                offset + len,
                self.data.len()
            ))
        })
    }

    /// Size of the buffered file
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}
