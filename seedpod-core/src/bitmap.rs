//! Segment bitmaps and the random-start circular scans over them.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8`, least significant bit first. Bits past
//! the last segment in the final byte are always zero.

/// Mask of the valid bits in the last byte of a bitmap for `segments_count` segments.
pub fn last_byte_mask(segments_count: u32) -> u8 {
    match segments_count % 8 {
        0 => 0xFF,
        r => (1u8 << r) - 1,
    }
}

/// Bitmap length in bytes for `segments_count` segments.
pub fn bitmap_len(segments_count: u32) -> usize {
    (segments_count as usize).div_ceil(8)
}

/// Check a bitmap received from a peer: exact length and clean padding bits.
pub fn validate(bytes: &[u8], segments_count: u32) -> Result<(), BitmapError> {
    let expected = bitmap_len(segments_count);
    if bytes.len() != expected {
        return Err(BitmapError::Length {
            expected,
            actual: bytes.len(),
        });
    }
    if let Some(&last) = bytes.last() {
        if last & !last_byte_mask(segments_count) != 0 {
            return Err(BitmapError::PaddingBits);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitmapError {
    #[error("bitmap length {actual} does not match expected {expected}")]
    Length { expected: usize, actual: usize },
    #[error("bitmap has bits set past the last segment")]
    PaddingBits,
}

/// Presence bitmap for the segments of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBitmap {
    bytes: Vec<u8>,
    segments_count: u32,
}

impl SegmentBitmap {
    /// No segment present.
    pub fn empty(segments_count: u32) -> Self {
        Self {
            bytes: vec![0; bitmap_len(segments_count)],
            segments_count,
        }
    }

    /// Every segment present.
    pub fn full(segments_count: u32) -> Self {
        let mut bytes = vec![0xFF; bitmap_len(segments_count)];
        if let Some(last) = bytes.last_mut() {
            *last = last_byte_mask(segments_count);
        }
        Self {
            bytes,
            segments_count,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, segments_count: u32) -> Result<Self, BitmapError> {
        validate(&bytes, segments_count)?;
        Ok(Self {
            bytes,
            segments_count,
        })
    }

    pub fn segments_count(&self) -> u32 {
        self.segments_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_set(&self, index: u32) -> bool {
        is_set(&self.bytes, index)
    }

    pub fn set(&mut self, index: u32) {
        assert!(index < self.segments_count, "segment {index} out of range");
        self.bytes[index as usize / 8] |= 1 << (index % 8);
    }

    pub fn clear(&mut self, index: u32) {
        assert!(index < self.segments_count, "segment {index} out of range");
        self.bytes[index as usize / 8] &= !(1 << (index % 8));
    }

    pub fn count_set(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_set() == self.segments_count
    }

    /// Indexes of all set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.segments_count).filter(|&i| self.is_set(i))
    }
}

/// Test bit `index` of a raw bitmap.
pub fn is_set(bytes: &[u8], index: u32) -> bool {
    bytes
        .get(index as usize / 8)
        .is_some_and(|b| b & (1 << (index % 8)) != 0)
}

/// Scan `len` bytes circularly from `start_byte`, collecting up to `max_count` bit indexes
/// for which `available(byte_index)` has the bit set.
fn circular_scan(
    len: usize,
    segments_count: u32,
    start_byte: usize,
    max_count: usize,
    available: impl Fn(usize) -> u8,
) -> Vec<u32> {
    let mut out = Vec::new();
    if len == 0 || max_count == 0 {
        return out;
    }
    let mask = last_byte_mask(segments_count);
    for step in 0..len {
        let i = (start_byte + step) % len;
        let mut bits = available(i);
        if i == len - 1 {
            bits &= mask;
        }
        while bits != 0 {
            let bit = bits.trailing_zeros();
            bits &= bits - 1;
            out.push(i as u32 * 8 + bit);
            if out.len() == max_count {
                return out;
            }
        }
    }
    out
}

/// Segments missing locally, present on the remote (`None` = remote has everything) and not
/// already in progress.
pub fn select_for_download(
    local: &[u8],
    in_progress: &[u8],
    remote: Option<&[u8]>,
    segments_count: u32,
    start_byte: usize,
    max_count: usize,
) -> Vec<u32> {
    circular_scan(local.len(), segments_count, start_byte, max_count, |i| {
        let remote_bits = remote.map_or(0xFF, |r| r.get(i).copied().unwrap_or(0));
        !local[i] & !in_progress.get(i).copied().unwrap_or(0) & remote_bits
    })
}

/// Segments present locally (`None` = local has everything) and absent on the remote.
pub fn select_for_offer(
    local: Option<&[u8]>,
    remote: &[u8],
    segments_count: u32,
    start_byte: usize,
    max_count: usize,
) -> Vec<u32> {
    circular_scan(remote.len(), segments_count, start_byte, max_count, |i| {
        let local_bits = local.map_or(0xFF, |l| l.get(i).copied().unwrap_or(0));
        local_bits & !remote[i]
    })
}
