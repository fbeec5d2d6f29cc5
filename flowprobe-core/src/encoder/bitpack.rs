//! Bit packing for counter columns
//!
//! A counter run is encoded by choosing the minimum byte width needed to
//! represent its maximum value: a 1-byte width prefix, a 4-byte little-endian
//! element count, and `count * width` packed bytes (big-endian within each
//! element). An all-zero run is encoded with width 0 and no payload.

use crate::{ProbeError, Result};

/// Size of the width prefix plus element count
pub const HEADER_SIZE: usize = 5;

/// Minimum number of bytes needed to represent `max`
pub fn byte_width(max: u64) -> usize {
    if max == 0 {
        return 0;
    }
    (64 - max.leading_zeros() as usize + 7) / 8
}

/// Pack a sequence of counters into a width-prefixed byte stream
pub fn pack(values: &[u64]) -> Vec<u8> {
    let width = byte_width(values.iter().copied().max().unwrap_or(0));

    let mut out = Vec::with_capacity(HEADER_SIZE + values.len() * width);
    out.push(width as u8);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());

    if width == 0 {
        return out;
    }
    for &value in values {
        out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
    }
    out
}

/// Number of elements in a packed stream
pub fn len(data: &[u8]) -> Result<usize> {
    if data.len() < HEADER_SIZE {
        return Err(ProbeError::CorruptBlock(format!(
            "packed counter stream too short ({} bytes)",
            data.len()
        )));
    }
    Ok(u32::from_le_bytes(data[1..HEADER_SIZE].try_into().unwrap()) as usize)
}

/// Unpack a packed stream into a fresh vector
pub fn unpack(data: &[u8]) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    unpack_into(data, &mut out)?;
    Ok(out)
}

/// Unpack a packed stream, appending to `out`. Allocation-free beyond the
/// output buffer. Returns the number of elements decoded.
pub fn unpack_into(data: &[u8], out: &mut Vec<u64>) -> Result<usize> {
    let count = len(data)?;
    let width = data[0] as usize;
    if width > 8 {
        return Err(ProbeError::CorruptBlock(format!(
            "invalid counter byte width {}",
            width
        )));
    }

    if width == 0 {
        if data.len() != HEADER_SIZE {
            return Err(ProbeError::CorruptBlock(
                "zero-width counter run carries a payload".into(),
            ));
        }
        out.resize(out.len() + count, 0);
        return Ok(count);
    }

    let payload = &data[HEADER_SIZE..];
    if payload.len() != count * width {
        return Err(ProbeError::CorruptBlock(format!(
            "packed counter payload length mismatch (want {}, have {})",
            count * width,
            payload.len()
        )));
    }

    out.reserve(count);
    for chunk in payload.chunks_exact(width) {
        let mut buf = [0u8; 8];
        buf[8 - width..].copy_from_slice(chunk);
        out.push(u64::from_be_bytes(buf));
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_width() {
        assert_eq!(byte_width(0), 0);
        assert_eq!(byte_width(1), 1);
        assert_eq!(byte_width(255), 1);
        assert_eq!(byte_width(256), 2);
        assert_eq!(byte_width(u32::MAX as u64), 4);
        assert_eq!(byte_width(u64::MAX), 8);
    }

    #[test]
    fn test_roundtrip() {
        let cases: Vec<Vec<u64>> = vec![
            vec![],
            vec![0],
            vec![0, 0, 0, 0],
            vec![1, 2, 3],
            vec![128, 65_535, 42],
            vec![u64::MAX, 0, 1],
            (0..1000).map(|i| i * 7919).collect(),
        ];
        for values in cases {
            let packed = pack(&values);
            assert_eq!(unpack(&packed).unwrap(), values, "case {:?}", values);
        }
    }

    #[test]
    fn test_zero_run_has_no_payload() {
        let packed = pack(&[0; 1000]);
        assert_eq!(packed.len(), HEADER_SIZE);
        assert_eq!(packed[0], 0);
        assert_eq!(len(&packed).unwrap(), 1000);
    }

    #[test]
    fn test_width_selection() {
        // one large value widens the whole run
        let packed = pack(&[1, 2, 1 << 40]);
        assert_eq!(packed[0], 6);
        assert_eq!(packed.len(), HEADER_SIZE + 3 * 6);
    }

    #[test]
    fn test_corrupt_input() {
        assert!(unpack(&[1, 0]).is_err());
        // truncated payload
        let mut packed = pack(&[1, 2, 3]);
        packed.pop();
        assert!(unpack(&packed).is_err());
        // nonsensical width
        let bad = [9u8, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(unpack(&bad).is_err());
    }
}
