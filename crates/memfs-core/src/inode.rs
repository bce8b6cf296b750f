//! Inode records.
//!
//! Inodes are fixed-size records stored *inline* inside their parent
//! directory's children array; only the root inode has an allocation of its
//! own. The two payload words are interpreted by kind: a directory carries
//! `(child_count, children_offset)`, a regular file `(size, first_block)`.

use memfs_error::{MemfsError, Result};
use memfs_image::Image;
use memfs_types::{
    decode_name, encode_name, read_le_u32, read_le_u64, write_le_u32, write_le_u64, ImageOffset,
    Timespec, INODE_SIZE, INO_ATIME_NANOS, INO_ATIME_SECS, INO_KIND, INO_MTIME_NANOS,
    INO_MTIME_SECS, INO_NAME, INO_WORD_A, INO_WORD_B, NAME_FIELD_SIZE,
};
use serde::Serialize;

const KIND_DIRECTORY: u32 = 0;
const KIND_REGULAR_FILE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InodeKind {
    Directory,
    RegularFile,
}

/// Kind-specific inode payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodePayload {
    Directory {
        child_count: u64,
        children: ImageOffset,
    },
    RegularFile {
        size: u64,
        first_block: ImageOffset,
    },
}

/// Decoded inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub name: String,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub payload: InodePayload,
}

impl Inode {
    #[must_use]
    pub fn new_file(name: &str, now: Timespec) -> Self {
        Self {
            name: name.to_owned(),
            atime: now,
            mtime: now,
            payload: InodePayload::RegularFile {
                size: 0,
                first_block: ImageOffset::NULL,
            },
        }
    }

    #[must_use]
    pub fn new_directory(name: &str, now: Timespec) -> Self {
        Self {
            name: name.to_owned(),
            atime: now,
            mtime: now,
            payload: InodePayload::Directory {
                child_count: 0,
                children: ImageOffset::NULL,
            },
        }
    }

    #[must_use]
    pub fn kind(&self) -> InodeKind {
        match self.payload {
            InodePayload::Directory { .. } => InodeKind::Directory,
            InodePayload::RegularFile { .. } => InodeKind::RegularFile,
        }
    }

    /// Decode the inode record stored at `off`.
    pub fn read_at(img: &Image<'_>, off: ImageOffset) -> Result<Self> {
        let raw = img.span(off, INODE_SIZE)?;
        let name = decode_name(&raw[..NAME_FIELD_SIZE]);
        let kind = read_le_u32(raw, INO_KIND as usize).map_err(MemfsError::from)?;
        let atime = Timespec {
            secs: read_le_u64(raw, INO_ATIME_SECS as usize).map_err(MemfsError::from)? as i64,
            nanos: read_le_u32(raw, INO_ATIME_NANOS as usize).map_err(MemfsError::from)?,
        };
        let mtime = Timespec {
            secs: read_le_u64(raw, INO_MTIME_SECS as usize).map_err(MemfsError::from)? as i64,
            nanos: read_le_u32(raw, INO_MTIME_NANOS as usize).map_err(MemfsError::from)?,
        };
        let word_a = read_le_u64(raw, INO_WORD_A as usize).map_err(MemfsError::from)?;
        let word_b = ImageOffset(read_le_u64(raw, INO_WORD_B as usize).map_err(MemfsError::from)?);

        let payload = match kind {
            KIND_DIRECTORY => InodePayload::Directory {
                child_count: word_a,
                children: word_b,
            },
            KIND_REGULAR_FILE => InodePayload::RegularFile {
                size: word_a,
                first_block: word_b,
            },
            other => {
                return Err(MemfsError::BadImage(format!(
                    "inode at {off} has unknown kind {other}"
                )))
            }
        };

        Ok(Self {
            name,
            atime,
            mtime,
            payload,
        })
    }

    /// Encode this inode into the record at `off`.
    pub fn write_at(&self, img: &mut Image<'_>, off: ImageOffset) -> Result<()> {
        let name_field = encode_name(&self.name).map_err(MemfsError::from)?;
        let (kind, word_a, word_b) = match self.payload {
            InodePayload::Directory {
                child_count,
                children,
            } => (KIND_DIRECTORY, child_count, children),
            InodePayload::RegularFile { size, first_block } => {
                (KIND_REGULAR_FILE, size, first_block)
            }
        };

        let raw = img.span_mut(off, INODE_SIZE)?;
        raw[INO_NAME as usize..NAME_FIELD_SIZE].copy_from_slice(&name_field);
        write_le_u32(raw, INO_KIND as usize, kind).map_err(MemfsError::from)?;
        write_le_u32(raw, INO_KIND as usize + 4, 0).map_err(MemfsError::from)?;
        write_le_u64(raw, INO_ATIME_SECS as usize, self.atime.secs as u64)
            .map_err(MemfsError::from)?;
        write_le_u32(raw, INO_ATIME_NANOS as usize, self.atime.nanos)
            .map_err(MemfsError::from)?;
        write_le_u32(raw, INO_ATIME_NANOS as usize + 4, 0).map_err(MemfsError::from)?;
        write_le_u64(raw, INO_MTIME_SECS as usize, self.mtime.secs as u64)
            .map_err(MemfsError::from)?;
        write_le_u32(raw, INO_MTIME_NANOS as usize, self.mtime.nanos)
            .map_err(MemfsError::from)?;
        write_le_u32(raw, INO_MTIME_NANOS as usize + 4, 0).map_err(MemfsError::from)?;
        write_le_u64(raw, INO_WORD_A as usize, word_a).map_err(MemfsError::from)?;
        write_le_u64(raw, INO_WORD_B as usize, word_b.0).map_err(MemfsError::from)?;
        Ok(())
    }
}

/// Overwrite only the name field of the record at `off`.
pub fn write_name_at(img: &mut Image<'_>, off: ImageOffset, name: &str) -> Result<()> {
    let name_field = encode_name(name).map_err(MemfsError::from)?;
    img.span_mut(off, NAME_FIELD_SIZE as u64)?
        .copy_from_slice(&name_field);
    Ok(())
}

/// Overwrite only the timestamp fields of the record at `off`.
pub fn write_times_at(
    img: &mut Image<'_>,
    off: ImageOffset,
    atime: Timespec,
    mtime: Timespec,
) -> Result<()> {
    img.write_u64(ImageOffset(off.0 + INO_ATIME_SECS), atime.secs as u64)?;
    img.write_u32(ImageOffset(off.0 + INO_ATIME_NANOS), atime.nanos)?;
    img.write_u64(ImageOffset(off.0 + INO_MTIME_SECS), mtime.secs as u64)?;
    img.write_u32(ImageOffset(off.0 + INO_MTIME_NANOS), mtime.nanos)?;
    Ok(())
}

/// Overwrite only the mtime field of the record at `off`.
pub fn write_mtime_at(img: &mut Image<'_>, off: ImageOffset, mtime: Timespec) -> Result<()> {
    img.write_u64(ImageOffset(off.0 + INO_MTIME_SECS), mtime.secs as u64)?;
    img.write_u32(ImageOffset(off.0 + INO_MTIME_NANOS), mtime.nanos)?;
    Ok(())
}

/// Overwrite only the two payload words of the record at `off`.
pub fn write_payload_words(
    img: &mut Image<'_>,
    off: ImageOffset,
    word_a: u64,
    word_b: ImageOffset,
) -> Result<()> {
    img.write_u64(ImageOffset(off.0 + INO_WORD_A), word_a)?;
    img.write_u64(ImageOffset(off.0 + INO_WORD_B), word_b.0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memfs_alloc::allocate;

    fn image_with_inode(node: &Inode) -> (Vec<u8>, ImageOffset) {
        let mut region = vec![0_u8; 4096];
        let off = {
            let mut img = Image::acquire(&mut region).unwrap();
            let off = allocate(&mut img, INODE_SIZE).unwrap();
            node.write_at(&mut img, off).unwrap();
            off
        };
        (region, off)
    }

    #[test]
    fn file_inode_round_trip() {
        let now = Timespec {
            secs: 1_700_000_000,
            nanos: 123_456_789,
        };
        let node = Inode::new_file("report.txt", now);
        let (mut region, off) = image_with_inode(&node);

        let img = Image::acquire(&mut region).unwrap();
        let back = Inode::read_at(&img, off).unwrap();
        assert_eq!(back, node);
        assert_eq!(back.kind(), InodeKind::RegularFile);
    }

    #[test]
    fn directory_inode_round_trip() {
        let node = Inode {
            name: "sub".to_owned(),
            atime: Timespec::EPOCH,
            mtime: Timespec {
                secs: -7,
                nanos: 1,
            },
            payload: InodePayload::Directory {
                child_count: 3,
                children: ImageOffset(512),
            },
        };
        let (mut region, off) = image_with_inode(&node);

        let img = Image::acquire(&mut region).unwrap();
        let back = Inode::read_at(&img, off).unwrap();
        assert_eq!(back, node);
        assert_eq!(back.mtime.secs, -7);
    }

    #[test]
    fn partial_field_writers() {
        let node = Inode::new_file("a", Timespec::EPOCH);
        let (mut region, off) = image_with_inode(&node);
        let mut img = Image::acquire(&mut region).unwrap();

        write_name_at(&mut img, off, "b").unwrap();
        let stamp = Timespec {
            secs: 42,
            nanos: 43,
        };
        write_mtime_at(&mut img, off, stamp).unwrap();
        write_payload_words(&mut img, off, 99, ImageOffset(640)).unwrap();

        let back = Inode::read_at(&img, off).unwrap();
        assert_eq!(back.name, "b");
        assert_eq!(back.mtime, stamp);
        assert_eq!(
            back.payload,
            InodePayload::RegularFile {
                size: 99,
                first_block: ImageOffset(640)
            }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let node = Inode::new_file("x", Timespec::EPOCH);
        let (mut region, off) = image_with_inode(&node);
        {
            let mut img = Image::acquire(&mut region).unwrap();
            img.write_u32(ImageOffset(off.0 + INO_KIND), 7).unwrap();
        }
        let mut img_region = region;
        let img = Image::acquire(&mut img_region).unwrap();
        assert!(matches!(
            Inode::read_at(&img, off),
            Err(MemfsError::BadImage(_))
        ));
    }
}
