//! Package identity and segment layout.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::integrity;

/// Default segment length in bytes (1 MiB).
pub const DEFAULT_SEGMENT_LENGTH: u64 = 1024 * 1024;

/// Content hash of the concatenation of all segment hashes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PackageId(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PackageId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PackageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the id of a package from its ordered segment hashes.
    pub fn from_segment_hashes(hashes: &[[u8; 32]]) -> Self {
        PackageId(integrity::hash_of_hashes(hashes))
    }

    /// First 4 bytes as hex, for log fields.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid package id: expected 64 hex characters")]
pub struct ParsePackageIdError;

impl FromStr for PackageId {
    type Err = ParsePackageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(ParsePackageIdError);
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ParsePackageIdError)?;
        }
        Ok(PackageId(out))
    }
}

/// How a package is laid out in segments.
///
/// All segments except the last are exactly `segment_length` bytes; the data file is
/// allocated to a whole number of segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSplitInfo {
    segment_length: u64,
    data_file_length: u64,
    package_size: u64,
}

impl PackageSplitInfo {
    /// Layout for a package of `package_size` bytes. A zero `segment_length` uses the default.
    pub fn new(package_size: u64, segment_length: u64) -> Self {
        let segment_length = if segment_length == 0 {
            DEFAULT_SEGMENT_LENGTH
        } else {
            segment_length
        };
        let segments = package_size.div_ceil(segment_length);
        Self {
            segment_length,
            data_file_length: segments * segment_length,
            package_size,
        }
    }

    pub fn segment_length(&self) -> u64 {
        self.segment_length
    }

    pub fn data_file_length(&self) -> u64 {
        self.data_file_length
    }

    pub fn package_size(&self) -> u64 {
        self.package_size
    }

    /// Saturates at `u32::MAX`; layouts that large fail [`Self::is_valid`].
    pub fn segments_count(&self) -> u32 {
        u32::try_from(self.package_size.div_ceil(self.segment_length)).unwrap_or(u32::MAX)
    }

    /// Whether the fields agree with each other and every segment has a `u32` index. Layouts
    /// read from disk or the network are checked with this before use.
    pub fn is_valid(&self) -> bool {
        if self.segment_length == 0 {
            return false;
        }
        let segments = self.package_size.div_ceil(self.segment_length);
        u32::try_from(segments).is_ok()
            && segments.checked_mul(self.segment_length) == Some(self.data_file_length)
    }

    /// Length of the final segment; 0 for an empty package.
    pub fn last_segment_length(&self) -> u64 {
        if self.package_size == 0 {
            return 0;
        }
        match self.package_size % self.segment_length {
            0 => self.segment_length,
            rest => rest,
        }
    }

    /// Size of segment `index`. Panics when the index is out of range.
    pub fn segment_size(&self, index: u32) -> u64 {
        let count = self.segments_count();
        assert!(index < count, "segment {index} out of range ({count} segments)");
        if index == count - 1 {
            self.last_segment_length()
        } else {
            self.segment_length
        }
    }

    /// Sum of the sizes of the given segments.
    pub fn segments_size(&self, indexes: &[u32]) -> u64 {
        indexes.iter().map(|&i| self.segment_size(i)).sum()
    }

    /// Byte offset of segment `index` in the data file.
    pub fn segment_offset(&self, index: u32) -> u64 {
        index as u64 * self.segment_length
    }

    /// Length in bytes of a segment bitmap for this package.
    pub fn bitmap_len(&self) -> usize {
        (self.segments_count() as usize).div_ceil(8)
    }
}
