#![forbid(unsafe_code)]
//! Free-space allocation inside a MemFS image.
//!
//! Address-ordered first-fit over a singly-linked free list whose nodes live
//! inside the free regions they describe, with immediate coalescing on free.
//!
//! ## Design
//!
//! Every block starts with a small header so the layout is reconstructable
//! from the bytes alone:
//!
//! - **allocated**: one word holding the user-visible size; `allocate`
//!   returns the offset just past it.
//! - **free**: two words, total size (header inclusive) and the offset of
//!   the next free block.
//!
//! The free list is kept sorted by offset, which makes coalescing a local
//! check against the immediate neighbours and keeps the layout deterministic
//! regardless of where the host maps the region. Exhaustion is reported as
//! `NoSpace`; a structurally broken list (unsorted, out of bounds) is
//! reported as a bad image instead of being walked forever.

use memfs_error::{MemfsError, Result};
use memfs_image::Image;
use memfs_types::{ImageOffset, ALLOC_HEADER_SIZE, FREE_HEADER_SIZE, HEADER_SIZE, MIN_ALLOC_SIZE};
use tracing::trace;

// ── Block headers ───────────────────────────────────────────────────────────

/// Decoded free-list node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    size: u64,
    next: ImageOffset,
}

fn read_free(img: &Image<'_>, off: ImageOffset) -> Result<FreeBlock> {
    let size = img.read_u64(off)?;
    let next = ImageOffset(img.read_u64(ImageOffset(off.0 + 8))?);
    let end = off
        .0
        .checked_add(size)
        .ok_or_else(|| MemfsError::BadImage("free block size overflow".to_owned()))?;
    if size < FREE_HEADER_SIZE || end > img.heap_end() {
        return Err(MemfsError::BadImage(format!(
            "free block at {off} with size {size} escapes the heap"
        )));
    }
    if !next.is_null() && next.0 <= off.0 {
        return Err(MemfsError::BadImage(format!(
            "free list not address-sorted at {off} (next {next})"
        )));
    }
    Ok(FreeBlock { size, next })
}

fn write_free(img: &mut Image<'_>, off: ImageOffset, block: FreeBlock) -> Result<()> {
    img.write_u64(off, block.size)?;
    img.write_u64(ImageOffset(off.0 + 8), block.next.0)
}

/// Read the user-visible size stored in an allocated block's header.
pub fn user_size(img: &Image<'_>, user_off: ImageOffset) -> Result<u64> {
    let header = header_offset(user_off)?;
    let size = img.read_u64(header)?;
    let end = user_off
        .0
        .checked_add(size)
        .ok_or_else(|| MemfsError::BadImage("allocated size overflow".to_owned()))?;
    if size < MIN_ALLOC_SIZE || end > img.heap_end() {
        return Err(MemfsError::BadImage(format!(
            "allocated block at {user_off} with size {size} escapes the heap"
        )));
    }
    Ok(size)
}

fn header_offset(user_off: ImageOffset) -> Result<ImageOffset> {
    if user_off.0 < HEADER_SIZE + ALLOC_HEADER_SIZE {
        return Err(MemfsError::BadImage(format!(
            "allocated offset {user_off} has no room for a block header"
        )));
    }
    Ok(ImageOffset(user_off.0 - ALLOC_HEADER_SIZE))
}

// ── Allocate / free / reallocate ────────────────────────────────────────────

/// Reserve at least `want` user bytes, returning the offset of the user area.
///
/// First fit over the address-sorted free list. When the residue after
/// carving out the request can hold a free-block header, the tail is
/// reinserted in place; otherwise the whole block is consumed and the slack
/// is recorded in the allocated header so accounting stays exact.
pub fn allocate(img: &mut Image<'_>, want: u64) -> Result<ImageOffset> {
    let want = want.max(MIN_ALLOC_SIZE);
    let need = want
        .checked_add(ALLOC_HEADER_SIZE)
        .ok_or(MemfsError::NoSpace)?;

    let mut prev: Option<ImageOffset> = None;
    let mut cur = img.free_head();
    while !cur.is_null() {
        let fb = read_free(img, cur)?;
        if fb.size >= need {
            let remainder = fb.size - need;
            let (successor, user) = if remainder >= FREE_HEADER_SIZE {
                let tail = ImageOffset(cur.0 + need);
                write_free(
                    img,
                    tail,
                    FreeBlock {
                        size: remainder,
                        next: fb.next,
                    },
                )?;
                (tail, want)
            } else {
                (fb.next, fb.size - ALLOC_HEADER_SIZE)
            };

            match prev {
                None => img.set_free_head(successor)?,
                Some(p) => img.write_u64(ImageOffset(p.0 + 8), successor.0)?,
            }

            img.write_u64(cur, user)?;
            let user_off = ImageOffset(cur.0 + ALLOC_HEADER_SIZE);
            trace!(
                target: "memfs::alloc",
                event = "allocate",
                offset = user_off.0,
                want,
                user,
            );
            return Ok(user_off);
        }
        prev = Some(cur);
        cur = fb.next;
    }

    trace!(target: "memfs::alloc", event = "exhausted", want);
    Err(MemfsError::NoSpace)
}

/// Release a previously-allocated block.
///
/// The block is inserted at its address-sorted position and merged with the
/// immediate left and right neighbours when physically contiguous, so no two
/// adjacent free blocks ever coexist on the list.
pub fn free(img: &mut Image<'_>, user_off: ImageOffset) -> Result<()> {
    let block = header_offset(user_off)?;
    let total = user_size(img, user_off)? + ALLOC_HEADER_SIZE;

    // Find the insertion point: prev < block < cur.
    let mut prev: Option<ImageOffset> = None;
    let mut cur = img.free_head();
    while !cur.is_null() && cur.0 < block.0 {
        let fb = read_free(img, cur)?;
        prev = Some(cur);
        cur = fb.next;
    }
    if cur == block {
        return Err(MemfsError::BadImage(format!(
            "double free of block at {block}"
        )));
    }

    // Merge with the right neighbour when contiguous.
    let mut size = total;
    let mut next = cur;
    if !cur.is_null() && block.0 + total == cur.0 {
        let right = read_free(img, cur)?;
        size += right.size;
        next = right.next;
    }

    match prev {
        None => {
            write_free(img, block, FreeBlock { size, next })?;
            img.set_free_head(block)?;
        }
        Some(p) => {
            let left = read_free(img, p)?;
            if p.0 + left.size == block.0 {
                // Merge with the left neighbour; the freed block's header
                // bytes are swallowed into the enlarged region.
                write_free(
                    img,
                    p,
                    FreeBlock {
                        size: left.size + size,
                        next,
                    },
                )?;
            } else {
                write_free(img, block, FreeBlock { size, next })?;
                img.write_u64(ImageOffset(p.0 + 8), block.0)?;
            }
        }
    }

    trace!(
        target: "memfs::alloc",
        event = "free",
        offset = user_off.0,
        total,
    );
    Ok(())
}

/// Resize an allocation, returning the (possibly moved) user offset.
///
/// `want == 0` is equivalent to `free` and returns the null offset. Growth
/// allocates fresh, copies, and frees the old block, so the original
/// allocation is untouched when growth fails. Shrinking happens in place and
/// never fails: when the trimmed tail can hold a free-block header it is
/// returned to the free list, otherwise it stays as recorded slack.
pub fn reallocate(img: &mut Image<'_>, user_off: ImageOffset, want: u64) -> Result<ImageOffset> {
    if user_off.is_null() {
        return allocate(img, want);
    }
    if want == 0 {
        free(img, user_off)?;
        return Ok(ImageOffset::NULL);
    }

    let want = want.max(MIN_ALLOC_SIZE);
    let old = user_size(img, user_off)?;

    if old >= want {
        let residue = old - want;
        if residue >= FREE_HEADER_SIZE {
            // Split the tail into its own allocated block and free it; the
            // free path coalesces it with any right neighbour.
            let header = header_offset(user_off)?;
            img.write_u64(header, want)?;
            let tail_user = ImageOffset(user_off.0 + want + ALLOC_HEADER_SIZE);
            img.write_u64(ImageOffset(user_off.0 + want), residue - ALLOC_HEADER_SIZE)?;
            free(img, tail_user)?;
        }
        return Ok(user_off);
    }

    let fresh = allocate(img, want)?;
    img.copy_span(user_off, fresh, old)?;
    free(img, user_off)?;
    Ok(fresh)
}

// ── Free-list queries ───────────────────────────────────────────────────────

/// Largest single user-visible allocation that could currently succeed.
pub fn largest_free_run(img: &Image<'_>) -> Result<u64> {
    let mut largest = 0_u64;
    let mut cur = img.free_head();
    while !cur.is_null() {
        let fb = read_free(img, cur)?;
        largest = largest.max(fb.size);
        cur = fb.next;
    }
    Ok(largest.saturating_sub(ALLOC_HEADER_SIZE))
}

/// Sum of free-list block sizes, header inclusive.
pub fn total_free(img: &Image<'_>) -> Result<u64> {
    let mut total = 0_u64;
    let mut cur = img.free_head();
    while !cur.is_null() {
        let fb = read_free(img, cur)?;
        total += fb.size;
        cur = fb.next;
    }
    Ok(total)
}

/// Enumerate the free list as `(offset, size)` pairs, in address order.
pub fn free_list(img: &Image<'_>) -> Result<Vec<(ImageOffset, u64)>> {
    let mut blocks = Vec::new();
    let mut cur = img.free_head();
    while !cur.is_null() {
        let fb = read_free(img, cur)?;
        blocks.push((cur, fb.size));
        cur = fb.next;
    }
    Ok(blocks)
}
