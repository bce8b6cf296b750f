#![forbid(unsafe_code)]
//! The MemFS image handle.
//!
//! An [`Image`] is the transient, per-call pairing of the host-supplied byte
//! region with its parsed header. It is derived in O(1) from the region on
//! every entry point and never outlives the call: the region may be remapped
//! to a different base address between mounts, so nothing derived from it is
//! allowed to persist.
//!
//! All reads and writes of image bytes go through the bounds-checked span
//! accessors here. Offset 0 is null by construction (the header lives
//! there), and any span reaching outside `[HEADER_SIZE, HEADER_SIZE +
//! usable_size)` is rejected as a bad image rather than touched.

use memfs_error::{MemfsError, Result};
use memfs_types::{
    read_le_u32, read_le_u64, u64_to_usize, write_le_u32, write_le_u64, ImageOffset,
    FREE_HEADER_SIZE, HDR_FREE_HEAD, HDR_MAGIC, HDR_ROOT, HDR_USABLE_SIZE, HEADER_SIZE,
    MEMFS_MAGIC,
};
use tracing::debug;

/// Per-call handle over the host-supplied byte region.
pub struct Image<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Image<'a> {
    /// Acquire a handle, initializing the image on first mount.
    ///
    /// A region shorter than the header is a bad state. A region whose magic
    /// does not match is (re)initialized: garbage past the header is zeroed
    /// (a fresh region already reads as zeros and is left alone), the header
    /// is written, and a single free block covering all usable bytes is
    /// installed. An already-initialized image is trusted, except that a
    /// stored usable size larger than the supplied region is rejected.
    pub fn acquire(bytes: &'a mut [u8]) -> Result<Self> {
        let total = bytes.len() as u64;
        if total < HEADER_SIZE {
            return Err(MemfsError::BadImage(format!(
                "region of {total} bytes is smaller than the {HEADER_SIZE}-byte header"
            )));
        }

        let magic = read_le_u32(bytes, HDR_MAGIC as usize).map_err(MemfsError::from)?;
        if magic == MEMFS_MAGIC {
            let img = Self { bytes };
            let usable = img.usable_size();
            if usable > total - HEADER_SIZE {
                return Err(MemfsError::BadImage(format!(
                    "header claims {usable} usable bytes but the region holds only {}",
                    total - HEADER_SIZE
                )));
            }
            return Ok(img);
        }

        // Not initialized. Anything nonzero past the header is stale garbage
        // from a previous life of the mapping and must not be trusted.
        if magic != 0 {
            bytes[HEADER_SIZE as usize..].fill(0);
        }

        let usable = total - HEADER_SIZE;
        write_le_u32(bytes, HDR_MAGIC as usize, MEMFS_MAGIC).map_err(MemfsError::from)?;
        write_le_u64(bytes, HDR_USABLE_SIZE as usize, usable).map_err(MemfsError::from)?;
        write_le_u64(bytes, HDR_ROOT as usize, 0).map_err(MemfsError::from)?;

        if usable >= FREE_HEADER_SIZE {
            // One free block spanning the whole usable area.
            let heap = HEADER_SIZE as usize;
            write_le_u64(bytes, heap, usable).map_err(MemfsError::from)?;
            write_le_u64(bytes, heap + 8, 0).map_err(MemfsError::from)?;
            write_le_u64(bytes, HDR_FREE_HEAD as usize, HEADER_SIZE).map_err(MemfsError::from)?;
        } else {
            write_le_u64(bytes, HDR_FREE_HEAD as usize, 0).map_err(MemfsError::from)?;
        }

        debug!(
            target: "memfs::image",
            event = "initialized",
            total,
            usable,
        );
        Ok(Self { bytes })
    }

    /// Total length of the underlying region in bytes.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Usable bytes past the header, as recorded in the header.
    #[must_use]
    pub fn usable_size(&self) -> u64 {
        read_le_u64(self.bytes, HDR_USABLE_SIZE as usize).unwrap_or(0)
    }

    /// First byte past the allocator-managed heap.
    #[must_use]
    pub fn heap_end(&self) -> u64 {
        HEADER_SIZE + self.usable_size()
    }

    #[must_use]
    pub fn free_head(&self) -> ImageOffset {
        ImageOffset(read_le_u64(self.bytes, HDR_FREE_HEAD as usize).unwrap_or(0))
    }

    pub fn set_free_head(&mut self, off: ImageOffset) -> Result<()> {
        write_le_u64(self.bytes, HDR_FREE_HEAD as usize, off.0).map_err(MemfsError::from)
    }

    #[must_use]
    pub fn root(&self) -> ImageOffset {
        ImageOffset(read_le_u64(self.bytes, HDR_ROOT as usize).unwrap_or(0))
    }

    pub fn set_root(&mut self, off: ImageOffset) -> Result<()> {
        write_le_u64(self.bytes, HDR_ROOT as usize, off.0).map_err(MemfsError::from)
    }

    /// Validate that `[off, off + len)` lies inside the heap, returning the
    /// starting index into the region.
    fn check_span(&self, off: ImageOffset, len: u64) -> Result<usize> {
        if off.is_null() {
            return Err(MemfsError::BadImage("null offset dereferenced".to_owned()));
        }
        let end = off
            .0
            .checked_add(len)
            .ok_or_else(|| MemfsError::BadImage("offset arithmetic overflow".to_owned()))?;
        if off.0 < HEADER_SIZE || end > self.heap_end() {
            return Err(MemfsError::BadImage(format!(
                "span [{}, {end}) escapes the image heap [{HEADER_SIZE}, {})",
                off.0,
                self.heap_end()
            )));
        }
        u64_to_usize(off.0, "span_offset").map_err(MemfsError::from)
    }

    /// Bounds-checked immutable span.
    pub fn span(&self, off: ImageOffset, len: u64) -> Result<&[u8]> {
        let start = self.check_span(off, len)?;
        let len = u64_to_usize(len, "span_len").map_err(MemfsError::from)?;
        Ok(&self.bytes[start..start + len])
    }

    /// Bounds-checked mutable span.
    pub fn span_mut(&mut self, off: ImageOffset, len: u64) -> Result<&mut [u8]> {
        let start = self.check_span(off, len)?;
        let len = u64_to_usize(len, "span_len").map_err(MemfsError::from)?;
        Ok(&mut self.bytes[start..start + len])
    }

    pub fn read_u64(&self, off: ImageOffset) -> Result<u64> {
        let span = self.span(off, 8)?;
        read_le_u64(span, 0).map_err(MemfsError::from)
    }

    pub fn write_u64(&mut self, off: ImageOffset, value: u64) -> Result<()> {
        let span = self.span_mut(off, 8)?;
        write_le_u64(span, 0, value).map_err(MemfsError::from)
    }

    pub fn read_u32(&self, off: ImageOffset) -> Result<u32> {
        let span = self.span(off, 4)?;
        read_le_u32(span, 0).map_err(MemfsError::from)
    }

    pub fn write_u32(&mut self, off: ImageOffset, value: u32) -> Result<()> {
        let span = self.span_mut(off, 4)?;
        write_le_u32(span, 0, value).map_err(MemfsError::from)
    }

    /// Copy `len` bytes from one heap span to another. Spans may overlap.
    pub fn copy_span(&mut self, src: ImageOffset, dst: ImageOffset, len: u64) -> Result<()> {
        let src_start = self.check_span(src, len)?;
        let dst_start = self.check_span(dst, len)?;
        let len = u64_to_usize(len, "copy_len").map_err(MemfsError::from)?;
        self.bytes
            .copy_within(src_start..src_start + len, dst_start);
        Ok(())
    }

    /// Zero a heap span.
    pub fn fill_zero(&mut self, off: ImageOffset, len: u64) -> Result<()> {
        self.span_mut(off, len)?.fill(0);
        Ok(())
    }
}
