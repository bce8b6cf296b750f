#![forbid(unsafe_code)]
//! MemFS core: the thirteen filesystem operations over a byte region.
//!
//! [`Fs`] wraps the per-call [`Image`] handle and implements the operation
//! surface a user-space filesystem driver needs: attribute query, directory
//! listing, file and directory creation/removal, rename, truncate, open,
//! read, write, timestamp update, and filesystem stats.
//!
//! Operations re-resolve paths from scratch; no offset into the image is
//! ever held across a mutation, because directory compaction and children
//! array reallocation move records underneath it. Failed operations leave
//! the image as if they had never been called: every fallible allocation
//! happens before the first structural write, or is pre-checked against
//! `largest_free_run`.

pub mod check;
pub mod dir;
pub mod file;
pub mod inode;
pub mod path;

pub use inode::{Inode, InodeKind, InodePayload};

use memfs_error::{MemfsError, Result};
use memfs_image::Image;
use memfs_types::{ImageOffset, Timespec, INODE_SIZE, NAME_MAX, STAT_BLOCK_SIZE};
use serde::Serialize;
use tracing::debug;

/// Attributes of one inode, as reported by `getattr`.
///
/// uid/gid are echoed from the caller and permissions are fixed at 0755;
/// access control is not enforced.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Attr {
    pub uid: u32,
    pub gid: u32,
    pub kind: InodeKind,
    pub perm: u16,
    pub nlink: u64,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
}

/// Filesystem usage summary, as reported by `statfs`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FsStats {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub available_blocks: u64,
    pub name_max: u64,
}

/// A mounted view over a host-supplied byte region.
pub struct Fs<'a> {
    img: Image<'a>,
}

impl<'a> Fs<'a> {
    /// Acquire the region, initializing the image and the root directory on
    /// first mount.
    pub fn open(region: &'a mut [u8]) -> Result<Self> {
        let mut img = Image::acquire(region)?;
        if img.root().is_null() {
            let off = memfs_alloc::allocate(&mut img, INODE_SIZE)?;
            Inode::new_directory("/", Timespec::now()).write_at(&mut img, off)?;
            img.set_root(off)?;
            debug!(target: "memfs::ops", event = "root_created", offset = off.0);
        }
        Ok(Self { img })
    }

    /// Borrow the underlying image handle (used by the checker and tools).
    #[must_use]
    pub fn image(&self) -> &Image<'a> {
        &self.img
    }

    pub fn getattr(&self, uid: u32, gid: u32, path: &str) -> Result<Attr> {
        let off = path::resolve(&self.img, path)?;
        let node = Inode::read_at(&self.img, off)?;
        let (nlink, size) = match node.payload {
            InodePayload::Directory { child_count, .. } => (child_count + 2, 0),
            InodePayload::RegularFile { size, .. } => (1, size),
        };
        Ok(Attr {
            uid,
            gid,
            kind: node.kind(),
            perm: 0o755,
            nlink,
            size,
            atime: node.atime,
            mtime: node.mtime,
        })
    }

    /// List child names of a directory, excluding `.` and `..`.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let off = path::resolve(&self.img, path)?;
        let dir = dir::read_dir(&self.img, off)?;
        let mut names = Vec::with_capacity(usize::try_from(dir.child_count).unwrap_or(0));
        for index in 0..dir.child_count {
            let slot = ImageOffset(dir.children.0 + index * INODE_SIZE);
            names.push(Inode::read_at(&self.img, slot)?.name);
        }
        Ok(names)
    }

    /// Create an empty regular file.
    pub fn mknod(&mut self, path: &str) -> Result<()> {
        self.create_entry(path, InodeKind::RegularFile)
    }

    /// Create an empty directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.create_entry(path, InodeKind::Directory)
    }

    fn create_entry(&mut self, path: &str, kind: InodeKind) -> Result<()> {
        match path::resolve(&self.img, path) {
            Ok(_) => return Err(MemfsError::Exists),
            Err(MemfsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let (parent_components, name) = path::split_parent(path)?;
        let parent = path::resolve_components(&self.img, &parent_components, path)?;

        let now = Timespec::now();
        let node = match kind {
            InodeKind::RegularFile => Inode::new_file(name, now),
            InodeKind::Directory => Inode::new_directory(name, now),
        };
        dir::append_child(&mut self.img, parent, &node)?;
        debug!(target: "memfs::ops", op = "create", path, kind = ?kind);
        Ok(())
    }

    /// Delete a regular file, releasing its content chain.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let off = path::resolve(&self.img, path)?;
        let node = Inode::read_at(&self.img, off)?;
        if node.kind() == InodeKind::Directory {
            return Err(MemfsError::IsDirectory);
        }

        let (parent_components, name) = path::split_parent(path)?;
        let parent = path::resolve_components(&self.img, &parent_components, path)?;
        self.remove_entry(parent, name)?;
        debug!(target: "memfs::ops", op = "unlink", path);
        Ok(())
    }

    /// Delete an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let off = path::resolve(&self.img, path)?;
        let removed = dir::read_dir(&self.img, off)?;
        if removed.child_count != 0 {
            return Err(MemfsError::NotEmpty);
        }

        let (parent_components, name) = path::split_parent(path)?;
        let parent = path::resolve_components(&self.img, &parent_components, path)?;
        self.remove_entry(parent, name)?;
        debug!(target: "memfs::ops", op = "rmdir", path);
        Ok(())
    }

    /// Rename or move an entry.
    ///
    /// An existing target is replaced with POSIX semantics: a file may
    /// replace a file, a directory may replace an empty directory; the
    /// mismatched pairings fail with `EISDIR`/`ENOTDIR` and a populated
    /// target directory with `ENOTEMPTY`. Moving a directory underneath
    /// itself is rejected.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let from_components = path::split_components(from)?;
        let to_components = path::split_components(to)?;
        if from_components == to_components {
            return Ok(());
        }
        if from_components.is_empty() {
            return Err(MemfsError::NotFound(from.to_owned()));
        }
        if to_components.is_empty() {
            return Err(MemfsError::NotFound(to.to_owned()));
        }

        let src_off = path::resolve_components(&self.img, &from_components, from)?;
        let src = Inode::read_at(&self.img, src_off)?;

        if src.kind() == InodeKind::Directory
            && to_components.len() > from_components.len()
            && to_components[..from_components.len()] == from_components[..]
        {
            return Err(MemfsError::Invalid(format!(
                "cannot move {from:?} underneath itself"
            )));
        }

        let (from_parent_components, from_name) = path::split_parent(from)?;
        let (to_parent_components, to_name) = path::split_parent(to)?;
        debug_assert!(to_name.len() <= NAME_MAX);

        let to_parent = path::resolve_components(&self.img, &to_parent_components, to)?;
        let to_dir = dir::read_dir(&self.img, to_parent)?;
        let same_dir = from_parent_components == to_parent_components;

        // Validate an existing target before anything is touched.
        let target = dir::lookup(&self.img, &to_dir, to_name)?;
        if let Some((_, target_slot)) = target {
            let target_node = Inode::read_at(&self.img, target_slot)?;
            match (src.kind(), target_node.kind()) {
                (InodeKind::RegularFile, InodeKind::Directory) => {
                    return Err(MemfsError::IsDirectory)
                }
                (InodeKind::Directory, InodeKind::RegularFile) => {
                    return Err(MemfsError::NotDirectory)
                }
                (InodeKind::Directory, InodeKind::Directory) => {
                    let t = dir::read_dir(&self.img, target_slot)?;
                    if t.child_count != 0 {
                        return Err(MemfsError::NotEmpty);
                    }
                }
                (InodeKind::RegularFile, InodeKind::RegularFile) => {}
            }
        }

        // A cross-directory move grows the destination's children array.
        // Pre-check the allocator so a replaced target can never end up
        // removed by an operation that then fails for space.
        if !same_dir {
            let needed = to_dir
                .child_count
                .checked_add(1)
                .and_then(|n| n.checked_mul(INODE_SIZE))
                .ok_or(MemfsError::NoSpace)?;
            if memfs_alloc::largest_free_run(&self.img)? < needed {
                return Err(MemfsError::NoSpace);
            }
        }

        if target.is_some() {
            self.remove_entry(to_parent, to_name)?;
        }

        // Every mutation above may have moved records; resolve fresh.
        if same_dir {
            let parent = path::resolve_components(&self.img, &from_parent_components, from)?;
            let d = dir::read_dir(&self.img, parent)?;
            let (_, slot) = dir::lookup(&self.img, &d, from_name)?
                .ok_or_else(|| MemfsError::NotFound(from.to_owned()))?;
            inode::write_name_at(&mut self.img, slot, to_name)?;
        } else {
            let from_parent =
                path::resolve_components(&self.img, &from_parent_components, from)?;
            let d = dir::read_dir(&self.img, from_parent)?;
            let (_, slot) = dir::lookup(&self.img, &d, from_name)?
                .ok_or_else(|| MemfsError::NotFound(from.to_owned()))?;
            let mut moved = Inode::read_at(&self.img, slot)?;
            moved.name = to_name.to_owned();

            let to_parent = path::resolve_components(&self.img, &to_parent_components, to)?;
            dir::append_child(&mut self.img, to_parent, &moved)?;

            // The append may have moved the source directory's own record.
            let from_parent =
                path::resolve_components(&self.img, &from_parent_components, from)?;
            let d = dir::read_dir(&self.img, from_parent)?;
            let (index, _) = dir::lookup(&self.img, &d, from_name)?
                .ok_or_else(|| MemfsError::NotFound(from.to_owned()))?;
            dir::remove_child(&mut self.img, from_parent, index)?;
        }

        debug!(target: "memfs::ops", op = "rename", from, to);
        Ok(())
    }

    /// Change a regular file's size; grown bytes read as zeros.
    pub fn truncate(&mut self, path: &str, new_size: u64) -> Result<()> {
        let off = path::resolve(&self.img, path)?;
        let node = Inode::read_at(&self.img, off)?;
        let InodePayload::RegularFile { size, first_block } = node.payload else {
            return Err(MemfsError::IsDirectory);
        };
        if new_size == size {
            return Ok(());
        }

        let first = file::chain_truncate(&mut self.img, first_block, size, new_size)?;
        inode::write_payload_words(&mut self.img, off, new_size, first)?;
        inode::write_mtime_at(&mut self.img, off, Timespec::now())?;
        debug!(target: "memfs::ops", op = "truncate", path, from = size, to = new_size);
        Ok(())
    }

    /// Check that a path resolves; the driver's `open` does nothing more.
    pub fn open_path(&self, path: &str) -> Result<()> {
        path::resolve(&self.img, path).map(|_| ())
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes delivered; zero at or past end of file.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let off = path::resolve(&self.img, path)?;
        let node = Inode::read_at(&self.img, off)?;
        let InodePayload::RegularFile { size, first_block } = node.payload else {
            return Err(MemfsError::IsDirectory);
        };
        file::chain_read(&self.img, first_block, size, offset, buf)
    }

    /// Write `buf` at `offset`, extending the file as needed.
    ///
    /// A write starting strictly past the end of the file writes nothing
    /// and returns 0; holes are not materialized. `offset == size` appends.
    pub fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        let off = path::resolve(&self.img, path)?;
        let node = Inode::read_at(&self.img, off)?;
        let InodePayload::RegularFile { size, first_block } = node.payload else {
            return Err(MemfsError::IsDirectory);
        };
        if offset > size || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len() as u64;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| MemfsError::Invalid("write range overflows".to_owned()))?;

        if end <= size {
            file::chain_overwrite(&mut self.img, first_block, offset, buf)?;
        } else {
            // Allocate the tail before overwriting anything in place.
            let overlap = usize::try_from(size - offset)
                .map_err(|_| MemfsError::Invalid("write range overflows".to_owned()))?;
            let tail = file::make_block(&mut self.img, &buf[overlap..])?;
            if overlap > 0 {
                file::chain_overwrite(&mut self.img, first_block, offset, &buf[..overlap])?;
            }
            let first = file::link_tail(&mut self.img, first_block, tail)?;
            inode::write_payload_words(&mut self.img, off, end, first)?;
        }

        inode::write_mtime_at(&mut self.img, off, Timespec::now())?;
        debug!(target: "memfs::ops", op = "write", path, offset, len);
        Ok(buf.len())
    }

    /// Set access and modification times.
    pub fn utimens(&mut self, path: &str, atime: Timespec, mtime: Timespec) -> Result<()> {
        let off = path::resolve(&self.img, path)?;
        // Reject records that don't decode before patching their fields.
        Inode::read_at(&self.img, off)?;
        inode::write_times_at(&mut self.img, off, atime, mtime)
    }

    /// Filesystem usage summary.
    pub fn statfs(&self) -> Result<FsStats> {
        let free = memfs_alloc::total_free(&self.img)?;
        Ok(FsStats {
            block_size: STAT_BLOCK_SIZE,
            total_blocks: self.img.usable_size() / STAT_BLOCK_SIZE,
            free_blocks: free / STAT_BLOCK_SIZE,
            available_blocks: free / STAT_BLOCK_SIZE,
            name_max: NAME_MAX as u64,
        })
    }

    /// Remove `name` from the directory at `parent`, releasing file content.
    fn remove_entry(&mut self, parent: ImageOffset, name: &str) -> Result<()> {
        let d = dir::read_dir(&self.img, parent)?;
        let (index, slot) = dir::lookup(&self.img, &d, name)?
            .ok_or_else(|| MemfsError::NotFound(name.to_owned()))?;
        let node = Inode::read_at(&self.img, slot)?;
        if let InodePayload::RegularFile { first_block, .. } = node.payload {
            file::free_chain(&mut self.img, first_block)?;
        }
        dir::remove_child(&mut self.img, parent, index)
    }
}
