//! Segment hashing (SHA-256), package id digest and incremental verification.

use sha2::{Digest, Sha256};

/// Hash a segment payload. Returns 32-byte digest.
pub fn hash_segment(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Hash of the concatenation of the given segment hashes (the package id digest).
pub fn hash_of_hashes(hashes: &[[u8; 32]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h);
    }
    hasher.finalize().into()
}

/// Split `data` by `segment_length` and hash each piece.
pub fn hash_segments(data: &[u8], segment_length: usize) -> Vec<[u8; 32]> {
    if segment_length == 0 {
        return vec![];
    }
    data.chunks(segment_length).map(hash_segment).collect()
}

/// Incremental verifier for a run of consecutive segments fed as arbitrary chunks.
///
/// Each segment is hashed as soon as its last byte arrives; the first mismatch is reported
/// with the segment index it belongs to.
pub struct SegmentVerifier {
    expected: Vec<(u32, u64, [u8; 32])>,
    current: usize,
    filled: u64,
    hasher: Sha256,
}

impl SegmentVerifier {
    /// `expected` lists (segment index, segment size, expected hash) in stream order.
    pub fn new(expected: Vec<(u32, u64, [u8; 32])>) -> Self {
        Self {
            expected,
            current: 0,
            filled: 0,
            hasher: Sha256::new(),
        }
    }

    /// Feed bytes. Returns the indexes of the segments completed and verified by this chunk.
    /// Bytes past the last expected segment are an `Overflow` error.
    pub fn update(&mut self, mut chunk: &[u8]) -> Result<Vec<u32>, VerifyError> {
        let mut completed = Vec::new();
        while !chunk.is_empty() {
            let Some(&(index, size, hash)) = self.expected.get(self.current) else {
                return Err(VerifyError::Overflow);
            };
            let take = ((size - self.filled) as usize).min(chunk.len());
            self.hasher.update(&chunk[..take]);
            self.filled += take as u64;
            chunk = &chunk[take..];
            if self.filled == size {
                let digest: [u8; 32] = std::mem::take(&mut self.hasher).finalize().into();
                if digest != hash {
                    return Err(VerifyError::Mismatch { segment: index });
                }
                completed.push(index);
                self.current += 1;
                self.filled = 0;
            }
        }
        Ok(completed)
    }

    /// Bytes still missing from the segment being hashed; `None` once every segment is in.
    pub fn remaining_in_segment(&self) -> Option<u64> {
        self.expected
            .get(self.current)
            .map(|&(_, size, _)| size - self.filled)
    }

    /// True once every expected segment has been received and verified.
    pub fn is_complete(&self) -> bool {
        self.current == self.expected.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("hash mismatch on segment {segment}")]
    Mismatch { segment: u32 },
    #[error("more bytes than the requested segments")]
    Overflow,
}
