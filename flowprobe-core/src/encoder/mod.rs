//! Block compression for column files
//!
//! A block payload is compressed by exactly one encoder, identified by a
//! 1-byte tag recorded in the sidecar header. Payloads carry no in-file
//! framing of their own beyond the encoder's frame format, so the tag is
//! authoritative for decoding.

pub mod bitpack;

use crate::{ProbeError, Result};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

/// Magic bytes of an LZ4 frame
pub const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

/// Magic bytes of a zstd frame
pub const ZSTD_FRAME_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// zstd compression level used on the write path
const ZSTD_LEVEL: i32 = 3;

/// Compression scheme tag stored per block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EncoderType {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl Default for EncoderType {
    fn default() -> Self {
        EncoderType::Lz4
    }
}

impl From<EncoderType> for u8 {
    fn from(t: EncoderType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for EncoderType {
    type Error = ProbeError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(EncoderType::None),
            1 => Ok(EncoderType::Lz4),
            2 => Ok(EncoderType::Zstd),
            unknown => Err(ProbeError::CorruptBlock(format!(
                "unknown encoder type {}",
                unknown
            ))),
        }
    }
}

impl EncoderType {
    /// Leading bytes a payload of this encoder is expected to start with
    pub fn frame_magic(&self) -> Option<[u8; 4]> {
        match self {
            EncoderType::None => None,
            EncoderType::Lz4 => Some(LZ4_FRAME_MAGIC),
            EncoderType::Zstd => Some(ZSTD_FRAME_MAGIC),
        }
    }
}

impl fmt::Display for EncoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderType::None => write!(f, "none"),
            EncoderType::Lz4 => write!(f, "lz4"),
            EncoderType::Zstd => write!(f, "zstd"),
        }
    }
}

/// Uniform compress/decompress contract shared by all encoders
pub trait Encoder: Send + Sync {
    /// The tag this encoder answers to
    fn kind(&self) -> EncoderType;

    /// Compress `data` into `sink`, returning the number of bytes written
    fn compress(&self, data: &[u8], sink: &mut dyn Write) -> Result<usize>;

    /// Decompress `src` into a buffer of exactly `raw_len` bytes
    fn decompress(&self, raw_len: usize, src: &[u8]) -> Result<Vec<u8>>;
}

/// Look up the encoder instance for a type
pub fn new_encoder(kind: EncoderType) -> Box<dyn Encoder> {
    match kind {
        EncoderType::None => Box::new(NullEncoder),
        EncoderType::Lz4 => Box::new(Lz4Encoder),
        EncoderType::Zstd => Box::new(ZstdEncoder),
    }
}

/// Resolve a raw tag byte to its encoder; unknown tags are corrupt
pub fn encoder_for_tag(tag: u8) -> Result<Box<dyn Encoder>> {
    Ok(new_encoder(EncoderType::try_from(tag)?))
}

/// Identity encoder
pub struct NullEncoder;

impl Encoder for NullEncoder {
    fn kind(&self) -> EncoderType {
        EncoderType::None
    }

    fn compress(&self, data: &[u8], sink: &mut dyn Write) -> Result<usize> {
        sink.write_all(data)?;
        Ok(data.len())
    }

    fn decompress(&self, raw_len: usize, src: &[u8]) -> Result<Vec<u8>> {
        if src.len() != raw_len {
            return Err(ProbeError::CorruptBlock(format!(
                "raw block length mismatch (want {}, have {})",
                raw_len,
                src.len()
            )));
        }
        Ok(src.to_vec())
    }
}

/// LZ4 frame encoder
pub struct Lz4Encoder;

impl Encoder for Lz4Encoder {
    fn kind(&self) -> EncoderType {
        EncoderType::Lz4
    }

    fn compress(&self, data: &[u8], sink: &mut dyn Write) -> Result<usize> {
        let mut frame = FrameEncoder::new(Vec::with_capacity(data.len() / 2 + 64));
        frame
            .write_all(data)
            .map_err(|e| ProbeError::Compression(e.to_string()))?;
        let compressed = frame
            .finish()
            .map_err(|e| ProbeError::Compression(e.to_string()))?;
        sink.write_all(&compressed)?;
        Ok(compressed.len())
    }

    fn decompress(&self, raw_len: usize, src: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; raw_len];
        let mut decoder = FrameDecoder::new(src);
        decoder
            .read_exact(&mut out)
            .map_err(|e| ProbeError::CorruptBlock(format!("lz4 frame: {}", e)))?;
        ensure_drained(&mut decoder)?;
        Ok(out)
    }
}

/// zstd frame encoder
pub struct ZstdEncoder;

impl Encoder for ZstdEncoder {
    fn kind(&self) -> EncoderType {
        EncoderType::Zstd
    }

    fn compress(&self, data: &[u8], sink: &mut dyn Write) -> Result<usize> {
        let compressed = zstd::stream::encode_all(data, ZSTD_LEVEL)
            .map_err(|e| ProbeError::Compression(e.to_string()))?;
        sink.write_all(&compressed)?;
        Ok(compressed.len())
    }

    fn decompress(&self, raw_len: usize, src: &[u8]) -> Result<Vec<u8>> {
        let out = zstd::stream::decode_all(src)
            .map_err(|e| ProbeError::CorruptBlock(format!("zstd frame: {}", e)))?;
        if out.len() != raw_len {
            return Err(ProbeError::CorruptBlock(format!(
                "raw block length mismatch (want {}, have {})",
                raw_len,
                out.len()
            )));
        }
        Ok(out)
    }
}

fn ensure_drained(reader: &mut dyn Read) -> Result<()> {
    let mut probe = [0u8; 1];
    let n = reader
        .read(&mut probe)
        .map_err(|e| ProbeError::CorruptBlock(format!("trailing read: {}", e)))?;
    if n != 0 {
        return Err(ProbeError::CorruptBlock(
            "block contains more data than its raw length".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Vec<u8> {
        // compressible but non-trivial payload
        (0..4096u32).flat_map(|i| [(i % 251) as u8, 0, 0, 1]).collect()
    }

    #[test]
    fn test_roundtrip_all_encoders() {
        for kind in [EncoderType::None, EncoderType::Lz4, EncoderType::Zstd] {
            let encoder = new_encoder(kind);
            let data = sample_data();

            let mut sink = Vec::new();
            let written = encoder.compress(&data, &mut sink).unwrap();
            assert_eq!(written, sink.len());

            let restored = encoder.decompress(data.len(), &sink).unwrap();
            assert_eq!(restored, data, "encoder {}", kind);
        }
    }

    #[test]
    fn test_frame_magic() {
        let data = sample_data();

        let mut lz4 = Vec::new();
        Lz4Encoder.compress(&data, &mut lz4).unwrap();
        assert_eq!(&lz4[..4], &LZ4_FRAME_MAGIC);

        let mut zst = Vec::new();
        ZstdEncoder.compress(&data, &mut zst).unwrap();
        assert_eq!(&zst[..4], &ZSTD_FRAME_MAGIC);
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let data = sample_data();
        for kind in [EncoderType::None, EncoderType::Lz4, EncoderType::Zstd] {
            let encoder = new_encoder(kind);
            let mut sink = Vec::new();
            encoder.compress(&data, &mut sink).unwrap();

            let err = encoder.decompress(data.len() + 1, &sink).unwrap_err();
            assert!(err.is_corruption(), "encoder {}: {}", kind, err);
        }
    }

    #[test]
    fn test_unknown_tag() {
        let err = match encoder_for_tag(42) {
            Err(e) => e,
            Ok(_) => panic!("expected encoder_for_tag(42) to fail"),
        };
        assert!(err.is_corruption());
        assert!(EncoderType::try_from(3).is_err());
    }

    #[test]
    fn test_tag_roundtrip() {
        for kind in [EncoderType::None, EncoderType::Lz4, EncoderType::Zstd] {
            assert_eq!(EncoderType::try_from(u8::from(kind)).unwrap(), kind);
        }
    }
}
