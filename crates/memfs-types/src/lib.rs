#![forbid(unsafe_code)]
//! Shared types and on-image layout constants for MemFS.
//!
//! Everything stored inside a MemFS image is referenced by a byte offset
//! from the image base, never by pointer, so an image can be remapped to a
//! different address between mounts. This crate defines the offset newtype,
//! the fixed little-endian field layout of every on-image structure, and the
//! bounds-checked field codecs the rest of the workspace reads and writes
//! through.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic number identifying an initialized image (header offset 0).
pub const MEMFS_MAGIC: u32 = 0xCAFE_BABE;

/// Bytes reserved for the image header at offset 0.
pub const HEADER_SIZE: u64 = 32;

/// Header field offsets.
pub const HDR_MAGIC: u64 = 0x00;
pub const HDR_USABLE_SIZE: u64 = 0x08;
pub const HDR_FREE_HEAD: u64 = 0x10;
pub const HDR_ROOT: u64 = 0x18;

/// Header of an allocated block: a single word holding the user-visible size.
pub const ALLOC_HEADER_SIZE: u64 = 8;

/// Header of a free block: total size (header inclusive) + next offset.
pub const FREE_HEADER_SIZE: u64 = 16;

/// Smallest user allocation; guarantees a freed block can hold a free header.
pub const MIN_ALLOC_SIZE: u64 = 8;

/// Maximum name length in bytes, excluding the NUL terminator.
pub const NAME_MAX: usize = 255;

/// Bytes of the fixed name field inside an inode (NUL-terminated).
pub const NAME_FIELD_SIZE: usize = 256;

/// Serialized size of an inode record.
pub const INODE_SIZE: u64 = 312;

/// Inode field offsets (relative to the inode record).
pub const INO_NAME: u64 = 0x000;
pub const INO_KIND: u64 = 0x100;
pub const INO_ATIME_SECS: u64 = 0x108;
pub const INO_ATIME_NANOS: u64 = 0x110;
pub const INO_MTIME_SECS: u64 = 0x118;
pub const INO_MTIME_NANOS: u64 = 0x120;
pub const INO_WORD_A: u64 = 0x128;
pub const INO_WORD_B: u64 = 0x130;

/// Serialized size of a file-block record.
pub const FILE_BLOCK_SIZE: u64 = 24;

/// File-block field offsets.
pub const FB_SIZE: u64 = 0x00;
pub const FB_DATA: u64 = 0x08;
pub const FB_NEXT: u64 = 0x10;

/// Block size reported by statfs.
pub const STAT_BLOCK_SIZE: u64 = 1024;

/// Byte offset from the image base.
///
/// Offset 0 universally means null/absent: the header occupies offset 0, so
/// no live entity can ever be stored there.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ImageOffset(pub u64);

impl ImageOffset {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

impl fmt::Display for ImageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds + nanoseconds timestamp pair, as stored in inodes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: u32,
}

impl Timespec {
    pub const EPOCH: Self = Self { secs: 0, nanos: 0 };

    /// Current wall-clock time. Pre-epoch clocks collapse to the epoch.
    #[must_use]
    pub fn now() -> Self {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(Self::EPOCH, |d| Self {
                secs: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nanos: d.subsec_nanos(),
            })
    }
}

/// Errors from the byte-level field codecs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], LayoutError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(LayoutError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(LayoutError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], LayoutError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(LayoutError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(LayoutError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, LayoutError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, LayoutError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), LayoutError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), LayoutError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Decode a NUL-terminated name field into a `String`.
///
/// Bytes after the first NUL are ignored; the name is not required to be
/// valid UTF-8 on-image, but lossy decoding keeps lookups deterministic.
#[must_use]
pub fn decode_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encode a name into a fixed NUL-padded field.
///
/// Rejects empty names, names longer than [`NAME_MAX`] bytes, and embedded
/// NUL bytes. Path separators cannot reach this codec: components are
/// produced by splitting on `/`, and the root inode's stored name is the
/// one literal `/` written at initialization.
pub fn encode_name(name: &str) -> Result<[u8; NAME_FIELD_SIZE], LayoutError> {
    let raw = name.as_bytes();
    if raw.is_empty() {
        return Err(LayoutError::InvalidField {
            field: "name",
            reason: "empty",
        });
    }
    if raw.len() > NAME_MAX {
        return Err(LayoutError::InvalidField {
            field: "name",
            reason: "longer than NAME_MAX",
        });
    }
    if raw.contains(&0) {
        return Err(LayoutError::InvalidField {
            field: "name",
            reason: "contains NUL",
        });
    }
    let mut field = [0_u8; NAME_FIELD_SIZE];
    field[..raw.len()].copy_from_slice(raw);
    Ok(field)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, LayoutError> {
    usize::try_from(value).map_err(|_| LayoutError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants_are_consistent() {
        assert_eq!(HEADER_SIZE, HDR_ROOT + 8);
        assert_eq!(INODE_SIZE, INO_WORD_B + 8);
        assert_eq!(FILE_BLOCK_SIZE, FB_NEXT + 8);
        assert!(MIN_ALLOC_SIZE + ALLOC_HEADER_SIZE >= FREE_HEADER_SIZE);
        assert_eq!(NAME_FIELD_SIZE, NAME_MAX + 1);
    }

    #[test]
    fn read_write_helpers_round_trip() {
        let mut buf = vec![0_u8; 16];
        write_le_u32(&mut buf, 0, 0xCAFE_BABE).unwrap();
        write_le_u64(&mut buf, 8, 0xDEAD_BEEF_0000_0001).unwrap();
        assert_eq!(read_le_u32(&buf, 0).unwrap(), 0xCAFE_BABE);
        assert_eq!(read_le_u64(&buf, 8).unwrap(), 0xDEAD_BEEF_0000_0001);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let buf = [0_u8; 4];
        assert!(matches!(
            read_le_u64(&buf, 0),
            Err(LayoutError::InsufficientData { needed: 8, .. })
        ));
        assert!(read_le_u32(&buf, 1).is_err());
        assert!(read_le_u32(&buf, usize::MAX).is_err());
    }

    #[test]
    fn name_codec_round_trip() {
        let field = encode_name("hello.txt").unwrap();
        assert_eq!(decode_name(&field), "hello.txt");
        assert_eq!(field[9], 0);
    }

    #[test]
    fn name_codec_rejects_bad_names() {
        assert!(encode_name("").is_err());
        assert!(encode_name("a\0b").is_err());
        assert!(encode_name(&"x".repeat(NAME_MAX)).is_ok());
        assert!(encode_name(&"x".repeat(NAME_MAX + 1)).is_err());
    }

    #[test]
    fn offset_checked_ops() {
        assert_eq!(ImageOffset(10).checked_add(5), Some(ImageOffset(15)));
        assert_eq!(ImageOffset(u64::MAX).checked_add(1), None);
        assert_eq!(ImageOffset(10).checked_sub(3), Some(ImageOffset(7)));
        assert_eq!(ImageOffset(0).checked_sub(1), None);
        assert!(ImageOffset::NULL.is_null());
        assert!(!ImageOffset(32).is_null());
    }

    #[test]
    fn timespec_now_is_post_epoch() {
        let now = Timespec::now();
        assert!(now.secs > 0);
        assert!(now.nanos < 1_000_000_000);
    }
}
