//! Directory mutation.
//!
//! A directory owns a single contiguous allocation holding its child inode
//! records inline, exactly `child_count` of them. Appending grows the array
//! through the allocator; removal overwrites the victim slot with the last
//! slot and shrinks. Slot indexes are therefore invalidated by every
//! mutation, and callers re-resolve paths instead of holding offsets.

use crate::inode::{write_payload_words, Inode, InodePayload};
use crate::path::lookup_child;
use memfs_alloc::{free, reallocate};
use memfs_error::{MemfsError, Result};
use memfs_image::Image;
use memfs_types::{ImageOffset, INODE_SIZE};

/// Directory identity: the record offset plus its decoded payload words.
#[derive(Debug, Clone, Copy)]
pub struct DirRef {
    pub off: ImageOffset,
    pub child_count: u64,
    pub children: ImageOffset,
}

/// Read the record at `off`, requiring it to be a directory.
pub fn read_dir(img: &Image<'_>, off: ImageOffset) -> Result<DirRef> {
    let node = Inode::read_at(img, off)?;
    match node.payload {
        InodePayload::Directory {
            child_count,
            children,
        } => Ok(DirRef {
            off,
            child_count,
            children,
        }),
        InodePayload::RegularFile { .. } => Err(MemfsError::NotDirectory),
    }
}

/// Find a child by name in `dir`.
pub fn lookup(img: &Image<'_>, dir: &DirRef, name: &str) -> Result<Option<(u64, ImageOffset)>> {
    lookup_child(img, dir.child_count, dir.children, name)
}

/// Append `child` to the directory at `dir_off`, growing the children array
/// by one record.
///
/// The array is reallocated before any directory field changes, so a failed
/// allocation leaves the directory untouched. Duplicate names are rejected.
pub fn append_child(img: &mut Image<'_>, dir_off: ImageOffset, child: &Inode) -> Result<()> {
    let dir = read_dir(img, dir_off)?;
    if lookup(img, &dir, &child.name)?.is_some() {
        return Err(MemfsError::Exists);
    }

    let new_count = dir
        .child_count
        .checked_add(1)
        .ok_or(MemfsError::NoSpace)?;
    let new_len = new_count
        .checked_mul(INODE_SIZE)
        .ok_or(MemfsError::NoSpace)?;

    let children = reallocate(img, dir.children, new_len)?;
    child.write_at(img, ImageOffset(children.0 + dir.child_count * INODE_SIZE))?;
    write_payload_words(img, dir_off, new_count, children)
}

/// Remove the child at `index`, compacting with the last slot.
///
/// The trailing record is byte-copied into the vacated slot, the count
/// drops, and the array shrinks in place (or is freed entirely at zero), so
/// removal cannot fail for lack of space.
pub fn remove_child(img: &mut Image<'_>, dir_off: ImageOffset, index: u64) -> Result<()> {
    let dir = read_dir(img, dir_off)?;
    if index >= dir.child_count {
        return Err(MemfsError::BadImage(format!(
            "child index {index} out of range in directory at {}",
            dir.off
        )));
    }

    let last = dir.child_count - 1;
    if index != last {
        img.copy_span(
            ImageOffset(dir.children.0 + last * INODE_SIZE),
            ImageOffset(dir.children.0 + index * INODE_SIZE),
            INODE_SIZE,
        )?;
    }

    let children = if last == 0 {
        free(img, dir.children)?;
        ImageOffset::NULL
    } else {
        reallocate(img, dir.children, last * INODE_SIZE)?
    };
    write_payload_words(img, dir_off, last, children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memfs_alloc::{allocate, total_free};
    use memfs_types::Timespec;

    fn with_root(region: &mut [u8]) -> (Image<'_>, ImageOffset) {
        let mut img = Image::acquire(region).unwrap();
        let root_off = allocate(&mut img, INODE_SIZE).unwrap();
        Inode::new_directory("/", Timespec::EPOCH)
            .write_at(&mut img, root_off)
            .unwrap();
        img.set_root(root_off).unwrap();
        (img, root_off)
    }

    #[test]
    fn append_and_lookup_children() {
        let mut region = vec![0_u8; 8192];
        let (mut img, root) = with_root(&mut region);

        for name in ["a", "b", "c"] {
            append_child(&mut img, root, &Inode::new_file(name, Timespec::EPOCH)).unwrap();
        }

        let dir = read_dir(&img, root).unwrap();
        assert_eq!(dir.child_count, 3);
        assert!(lookup(&img, &dir, "b").unwrap().is_some());
        assert!(lookup(&img, &dir, "z").unwrap().is_none());
        let (index, slot) = lookup(&img, &dir, "c").unwrap().unwrap();
        assert_eq!(index, 2);
        assert_eq!(Inode::read_at(&img, slot).unwrap().name, "c");
    }

    #[test]
    fn append_rejects_duplicate_names() {
        let mut region = vec![0_u8; 8192];
        let (mut img, root) = with_root(&mut region);

        append_child(&mut img, root, &Inode::new_file("a", Timespec::EPOCH)).unwrap();
        assert!(matches!(
            append_child(&mut img, root, &Inode::new_file("a", Timespec::EPOCH)),
            Err(MemfsError::Exists)
        ));
        assert_eq!(read_dir(&img, root).unwrap().child_count, 1);
    }

    #[test]
    fn remove_compacts_with_last_slot() {
        let mut region = vec![0_u8; 8192];
        let (mut img, root) = with_root(&mut region);

        for name in ["a", "b", "c"] {
            append_child(&mut img, root, &Inode::new_file(name, Timespec::EPOCH)).unwrap();
        }

        let dir = read_dir(&img, root).unwrap();
        let (index, _) = lookup(&img, &dir, "a").unwrap().unwrap();
        remove_child(&mut img, root, index).unwrap();

        let dir = read_dir(&img, root).unwrap();
        assert_eq!(dir.child_count, 2);
        // "c" was the trailing record and now occupies a's old slot.
        let (index, _) = lookup(&img, &dir, "c").unwrap().unwrap();
        assert_eq!(index, 0);
        assert!(lookup(&img, &dir, "a").unwrap().is_none());
    }

    #[test]
    fn removing_last_child_frees_the_array() {
        let mut region = vec![0_u8; 8192];
        let (mut img, root) = with_root(&mut region);
        let free_before = total_free(&img).unwrap();

        append_child(&mut img, root, &Inode::new_file("only", Timespec::EPOCH)).unwrap();
        remove_child(&mut img, root, 0).unwrap();

        let dir = read_dir(&img, root).unwrap();
        assert_eq!(dir.child_count, 0);
        assert!(dir.children.is_null());
        assert_eq!(total_free(&img).unwrap(), free_before);
    }

    #[test]
    fn failed_grow_leaves_directory_untouched() {
        // Small image: root fits, a second children-array growth does not.
        let mut region = vec![0_u8; 820];
        let (mut img, root) = with_root(&mut region);

        append_child(&mut img, root, &Inode::new_file("a", Timespec::EPOCH)).unwrap();
        let before = read_dir(&img, root).unwrap();
        assert!(matches!(
            append_child(&mut img, root, &Inode::new_file("b", Timespec::EPOCH)),
            Err(MemfsError::NoSpace)
        ));
        let after = read_dir(&img, root).unwrap();
        assert_eq!(after.child_count, before.child_count);
        assert_eq!(after.children, before.children);
    }

    #[test]
    fn read_dir_rejects_files() {
        let mut region = vec![0_u8; 8192];
        let (mut img, root) = with_root(&mut region);
        append_child(&mut img, root, &Inode::new_file("f", Timespec::EPOCH)).unwrap();
        let dir = read_dir(&img, root).unwrap();
        let (_, slot) = lookup(&img, &dir, "f").unwrap().unwrap();
        assert!(matches!(
            read_dir(&img, slot),
            Err(MemfsError::NotDirectory)
        ));
    }
}
