#![forbid(unsafe_code)]
//! Host-driver API for MemFS.
//!
//! This crate is a thin translation layer: a user-space filesystem driver
//! calls these thirteen entry points with the mapped byte region, an errno
//! out-parameter, and the operation arguments. Each call acquires a fresh
//! handle over the region, runs the core operation, and maps failures
//! through [`MemfsError::to_errno()`]. Success is 0 (or a byte/entry count);
//! failure is -1 with errno filled in, matching the classic driver calling
//! convention.
//!
//! The core is single-threaded by contract; a multi-threaded host can wrap
//! its region in [`SharedImage`], which serializes every call behind one
//! mutex at the handle-acquisition boundary.

use memfs_core::{Attr, Fs, InodeKind};
use memfs_error::{MemfsError, Result};
use memfs_types::Timespec;
use parking_lot::Mutex;
use tracing::warn;

// ── Out-parameter records ───────────────────────────────────────────────────

/// Stat-style attribute record filled by [`memfs_getattr`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatBuf {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
}

impl StatBuf {
    fn from_attr(attr: &Attr) -> Self {
        let type_bits = match attr.kind {
            InodeKind::Directory => libc::S_IFDIR,
            InodeKind::RegularFile => libc::S_IFREG,
        };
        Self {
            uid: attr.uid,
            gid: attr.gid,
            mode: type_bits | u32::from(attr.perm),
            nlink: attr.nlink,
            size: attr.size,
            atime: attr.atime,
            mtime: attr.mtime,
        }
    }
}

/// statvfs-style usage record filled by [`memfs_statfs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatvfsBuf {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub namemax: u64,
}

// ── Error translation ───────────────────────────────────────────────────────

fn fail(errno_out: &mut i32, op: &'static str, err: &MemfsError) {
    let errno = err.to_errno();
    // Missing entries are routine; anything else is worth a warning.
    if errno != libc::ENOENT {
        warn!(target: "memfs::host", op, errno, error = %err, "operation failed");
    }
    *errno_out = errno;
}

fn run_unit(errno_out: &mut i32, op: &'static str, result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            fail(errno_out, op, &err);
            -1
        }
    }
}

fn non_negative(errno_out: &mut i32, op: &'static str, offset: i64) -> Option<u64> {
    match u64::try_from(offset) {
        Ok(v) => Some(v),
        Err(_) => {
            fail(
                errno_out,
                op,
                &MemfsError::Invalid(format!("negative offset {offset}")),
            );
            None
        }
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Emulates `stat(2)`. Returns 0 on success, -1 with errno on failure.
pub fn memfs_getattr(
    region: &mut [u8],
    errno_out: &mut i32,
    uid: u32,
    gid: u32,
    path: &str,
    out: &mut StatBuf,
) -> i32 {
    match Fs::open(region).and_then(|fs| fs.getattr(uid, gid, path)) {
        Ok(attr) => {
            *out = StatBuf::from_attr(&attr);
            0
        }
        Err(err) => {
            fail(errno_out, "getattr", &err);
            -1
        }
    }
}

/// Emulates `readdir(3)`: fills `names_out` with child names (no `.`/`..`)
/// and returns the entry count, or -1 with errno.
pub fn memfs_readdir(
    region: &mut [u8],
    errno_out: &mut i32,
    path: &str,
    names_out: &mut Vec<String>,
) -> i64 {
    match Fs::open(region).and_then(|fs| fs.readdir(path)) {
        Ok(names) => {
            let count = names.len() as i64;
            *names_out = names;
            count
        }
        Err(err) => {
            fail(errno_out, "readdir", &err);
            -1
        }
    }
}

/// Emulates `mknod(2)` for regular files.
pub fn memfs_mknod(region: &mut [u8], errno_out: &mut i32, path: &str) -> i32 {
    run_unit(
        errno_out,
        "mknod",
        Fs::open(region).and_then(|mut fs| fs.mknod(path)),
    )
}

/// Emulates `unlink(2)`.
pub fn memfs_unlink(region: &mut [u8], errno_out: &mut i32, path: &str) -> i32 {
    run_unit(
        errno_out,
        "unlink",
        Fs::open(region).and_then(|mut fs| fs.unlink(path)),
    )
}

/// Emulates `rmdir(2)`.
pub fn memfs_rmdir(region: &mut [u8], errno_out: &mut i32, path: &str) -> i32 {
    run_unit(
        errno_out,
        "rmdir",
        Fs::open(region).and_then(|mut fs| fs.rmdir(path)),
    )
}

/// Emulates `mkdir(2)`.
pub fn memfs_mkdir(region: &mut [u8], errno_out: &mut i32, path: &str) -> i32 {
    run_unit(
        errno_out,
        "mkdir",
        Fs::open(region).and_then(|mut fs| fs.mkdir(path)),
    )
}

/// Emulates `rename(2)`, including moves between directories.
pub fn memfs_rename(region: &mut [u8], errno_out: &mut i32, from: &str, to: &str) -> i32 {
    run_unit(
        errno_out,
        "rename",
        Fs::open(region).and_then(|mut fs| fs.rename(from, to)),
    )
}

/// Emulates `truncate(2)`.
pub fn memfs_truncate(region: &mut [u8], errno_out: &mut i32, path: &str, size: i64) -> i32 {
    let Some(size) = non_negative(errno_out, "truncate", size) else {
        return -1;
    };
    run_unit(
        errno_out,
        "truncate",
        Fs::open(region).and_then(|mut fs| fs.truncate(path, size)),
    )
}

/// Emulates `open(2)` as a pure existence check; no handle is created.
pub fn memfs_open(region: &mut [u8], errno_out: &mut i32, path: &str) -> i32 {
    run_unit(
        errno_out,
        "open",
        Fs::open(region).and_then(|fs| fs.open_path(path)),
    )
}

/// Emulates `read(2)`: returns bytes delivered (0 at end of file), or -1.
pub fn memfs_read(
    region: &mut [u8],
    errno_out: &mut i32,
    path: &str,
    buf: &mut [u8],
    offset: i64,
) -> i64 {
    let Some(offset) = non_negative(errno_out, "read", offset) else {
        return -1;
    };
    match Fs::open(region).and_then(|fs| fs.read(path, buf, offset)) {
        Ok(count) => count as i64,
        Err(err) => {
            fail(errno_out, "read", &err);
            -1
        }
    }
}

/// Emulates `write(2)`: returns bytes written, or -1.
pub fn memfs_write(
    region: &mut [u8],
    errno_out: &mut i32,
    path: &str,
    buf: &[u8],
    offset: i64,
) -> i64 {
    let Some(offset) = non_negative(errno_out, "write", offset) else {
        return -1;
    };
    match Fs::open(region).and_then(|mut fs| fs.write(path, buf, offset)) {
        Ok(count) => count as i64,
        Err(err) => {
            fail(errno_out, "write", &err);
            -1
        }
    }
}

/// Emulates `utimensat(2)`: `times[0]` is atime, `times[1]` is mtime.
pub fn memfs_utimens(
    region: &mut [u8],
    errno_out: &mut i32,
    path: &str,
    times: [Timespec; 2],
) -> i32 {
    run_unit(
        errno_out,
        "utimens",
        Fs::open(region).and_then(|mut fs| fs.utimens(path, times[0], times[1])),
    )
}

/// Emulates `statvfs(3)`.
pub fn memfs_statfs(region: &mut [u8], errno_out: &mut i32, out: &mut StatvfsBuf) -> i32 {
    match Fs::open(region).and_then(|fs| fs.statfs()) {
        Ok(stats) => {
            *out = StatvfsBuf {
                bsize: stats.block_size,
                blocks: stats.total_blocks,
                bfree: stats.free_blocks,
                bavail: stats.available_blocks,
                namemax: stats.name_max,
            };
            0
        }
        Err(err) => {
            fail(errno_out, "statfs", &err);
            -1
        }
    }
}

// ── Shared region for multi-threaded hosts ──────────────────────────────────

/// An owned image region behind a single mutex.
///
/// The core has no locks of its own because the driver serializes calls;
/// a multi-threaded host puts the one required lock here, at the
/// handle-acquisition boundary.
pub struct SharedImage {
    region: Mutex<Vec<u8>>,
}

impl SharedImage {
    /// Allocate a zeroed region of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            region: Mutex::new(vec![0_u8; size]),
        }
    }

    /// Wrap an existing region (for example, one read from a backing file).
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            region: Mutex::new(bytes),
        }
    }

    /// Run `f` with exclusive access to the region.
    pub fn with_region<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        let mut region = self.region.lock();
        f(&mut region)
    }

    /// Take the region back out (for example, to write a backing file).
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.region.into_inner()
    }
}
