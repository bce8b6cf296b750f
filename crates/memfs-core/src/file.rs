//! File content chains.
//!
//! A regular file's content is a singly-linked chain of file blocks, each a
//! small record pointing at its own data payload. The chain primitives here
//! keep one ordering rule: allocations happen before any existing structure
//! is modified, so a failed growth leaves the file exactly as it was.

use memfs_alloc::{allocate, free, reallocate};
use memfs_error::{MemfsError, Result};
use memfs_image::Image;
use memfs_types::{u64_to_usize, ImageOffset, FB_DATA, FB_NEXT, FB_SIZE, FILE_BLOCK_SIZE};

/// Decoded file-block record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBlock {
    pub size: u64,
    pub data: ImageOffset,
    pub next: ImageOffset,
}

pub fn read_block(img: &Image<'_>, off: ImageOffset) -> Result<FileBlock> {
    Ok(FileBlock {
        size: img.read_u64(ImageOffset(off.0 + FB_SIZE))?,
        data: ImageOffset(img.read_u64(ImageOffset(off.0 + FB_DATA))?),
        next: ImageOffset(img.read_u64(ImageOffset(off.0 + FB_NEXT))?),
    })
}

pub fn write_block(img: &mut Image<'_>, off: ImageOffset, block: FileBlock) -> Result<()> {
    img.write_u64(ImageOffset(off.0 + FB_SIZE), block.size)?;
    img.write_u64(ImageOffset(off.0 + FB_DATA), block.data.0)?;
    img.write_u64(ImageOffset(off.0 + FB_NEXT), block.next.0)
}

/// Allocate a block record plus payload holding `content`.
///
/// The payload is allocated first and released again if the record
/// allocation fails, so a partial make never leaks.
pub fn make_block(img: &mut Image<'_>, content: &[u8]) -> Result<ImageOffset> {
    debug_assert!(!content.is_empty());
    let len = content.len() as u64;
    let data = allocate(img, len)?;
    let record = match allocate(img, FILE_BLOCK_SIZE) {
        Ok(record) => record,
        Err(err) => {
            free(img, data)?;
            return Err(err);
        }
    };
    img.span_mut(data, len)?.copy_from_slice(content);
    write_block(
        img,
        record,
        FileBlock {
            size: len,
            data,
            next: ImageOffset::NULL,
        },
    )?;
    Ok(record)
}

/// Allocate a zero-filled block of `len` bytes.
pub fn make_zero_block(img: &mut Image<'_>, len: u64) -> Result<ImageOffset> {
    debug_assert!(len > 0);
    let data = allocate(img, len)?;
    let record = match allocate(img, FILE_BLOCK_SIZE) {
        Ok(record) => record,
        Err(err) => {
            free(img, data)?;
            return Err(err);
        }
    };
    img.fill_zero(data, len)?;
    write_block(
        img,
        record,
        FileBlock {
            size: len,
            data,
            next: ImageOffset::NULL,
        },
    )?;
    Ok(record)
}

/// Release every block of a chain together with its payload.
pub fn free_chain(img: &mut Image<'_>, first: ImageOffset) -> Result<()> {
    let mut cur = first;
    while !cur.is_null() {
        let block = read_block(img, cur)?;
        if !block.data.is_null() {
            free(img, block.data)?;
        }
        free(img, cur)?;
        cur = block.next;
    }
    Ok(())
}

/// Link `tail` to the end of the chain, returning the (possibly new) head.
pub fn link_tail(
    img: &mut Image<'_>,
    first: ImageOffset,
    tail: ImageOffset,
) -> Result<ImageOffset> {
    if first.is_null() {
        return Ok(tail);
    }
    let mut cur = first;
    loop {
        let block = read_block(img, cur)?;
        if block.next.is_null() {
            img.write_u64(ImageOffset(cur.0 + FB_NEXT), tail.0)?;
            return Ok(first);
        }
        cur = block.next;
    }
}

/// Copy file bytes starting at `offset` into `buf`, walking the chain.
///
/// Returns the number of bytes delivered: short counts at end of file,
/// zero at or past it.
pub fn chain_read(
    img: &Image<'_>,
    first: ImageOffset,
    file_size: u64,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    if offset >= file_size {
        return Ok(0);
    }
    let want = (buf.len() as u64).min(file_size - offset);

    let mut skip = offset;
    let mut copied = 0_u64;
    let mut cur = first;
    while !cur.is_null() && copied < want {
        let block = read_block(img, cur)?;
        if skip >= block.size {
            skip -= block.size;
            cur = block.next;
            continue;
        }
        let take = (block.size - skip).min(want - copied);
        let src = img.span(ImageOffset(block.data.0 + skip), take)?;
        let copied_idx = u64_to_usize(copied, "read_cursor").map_err(MemfsError::from)?;
        let take_idx = u64_to_usize(take, "read_take").map_err(MemfsError::from)?;
        buf[copied_idx..copied_idx + take_idx].copy_from_slice(src);
        copied += take;
        skip = 0;
        cur = block.next;
    }
    u64_to_usize(copied, "read_total").map_err(MemfsError::from)
}

/// Overwrite existing file bytes starting at `offset` with `data`.
///
/// The byte range must already lie inside the chain's extent; a chain that
/// runs out early contradicts the recorded size and is a bad image.
pub fn chain_overwrite(
    img: &mut Image<'_>,
    first: ImageOffset,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let mut skip = offset;
    let mut written = 0_usize;
    let mut cur = first;
    while written < data.len() {
        if cur.is_null() {
            return Err(MemfsError::BadImage(
                "file chain shorter than the recorded size".to_owned(),
            ));
        }
        let block = read_block(img, cur)?;
        if skip >= block.size {
            skip -= block.size;
            cur = block.next;
            continue;
        }
        let take = (block.size - skip).min((data.len() - written) as u64);
        let take_idx = u64_to_usize(take, "write_take").map_err(MemfsError::from)?;
        img.span_mut(ImageOffset(block.data.0 + skip), take)?
            .copy_from_slice(&data[written..written + take_idx]);
        written += take_idx;
        skip = 0;
        cur = block.next;
    }
    Ok(())
}

/// Resize a chain from `old_size` to `new_size` bytes, returning the new
/// head. Grown bytes read as zeros; shrinking returns truncated blocks and
/// payload tails to the allocator.
pub fn chain_truncate(
    img: &mut Image<'_>,
    first: ImageOffset,
    old_size: u64,
    new_size: u64,
) -> Result<ImageOffset> {
    if new_size == old_size {
        return Ok(first);
    }

    if new_size == 0 {
        free_chain(img, first)?;
        return Ok(ImageOffset::NULL);
    }

    if new_size > old_size {
        // Zero tail first; the existing chain is untouched on failure.
        let tail = make_zero_block(img, new_size - old_size)?;
        return link_tail(img, first, tail);
    }

    // Shrink: walk to the block containing the new boundary.
    let mut remaining = new_size;
    let mut cur = first;
    loop {
        if cur.is_null() {
            return Err(MemfsError::BadImage(
                "file chain shorter than the recorded size".to_owned(),
            ));
        }
        let block = read_block(img, cur)?;
        if remaining > block.size {
            remaining -= block.size;
            cur = block.next;
            continue;
        }
        if remaining == block.size {
            // Boundary falls exactly at this block's end.
            free_chain(img, block.next)?;
            img.write_u64(ImageOffset(cur.0 + FB_NEXT), 0)?;
            return Ok(first);
        }
        // Boundary falls inside this block: shrink its payload in place.
        let data = reallocate(img, block.data, remaining)?;
        free_chain(img, block.next)?;
        write_block(
            img,
            cur,
            FileBlock {
                size: remaining,
                data,
                next: ImageOffset::NULL,
            },
        )?;
        return Ok(first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memfs_alloc::total_free;

    fn image(region: &mut Vec<u8>) -> Image<'_> {
        Image::acquire(region).unwrap()
    }

    #[test]
    fn single_block_read_back() {
        let mut region = vec![0_u8; 4096];
        let mut img = image(&mut region);
        let first = make_block(&mut img, b"Hello, world!\n").unwrap();

        let mut buf = [0_u8; 14];
        let n = chain_read(&img, first, 14, 0, &mut buf).unwrap();
        assert_eq!(n, 14);
        assert_eq!(&buf, b"Hello, world!\n");
    }

    #[test]
    fn read_spans_multiple_blocks() {
        let mut region = vec![0_u8; 8192];
        let mut img = image(&mut region);
        let first = make_block(&mut img, b"abcde").unwrap();
        let second = make_block(&mut img, b"fghij").unwrap();
        let first = link_tail(&mut img, first, second).unwrap();

        let mut buf = [0_u8; 10];
        assert_eq!(chain_read(&img, first, 10, 0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"abcdefghij");

        // Offsets landing inside and past the first block.
        let mut buf = [0_u8; 4];
        assert_eq!(chain_read(&img, first, 10, 3, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"defg");
        assert_eq!(chain_read(&img, first, 10, 8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ij");
        assert_eq!(chain_read(&img, first, 10, 10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn overwrite_across_block_seam() {
        let mut region = vec![0_u8; 8192];
        let mut img = image(&mut region);
        let first = make_block(&mut img, b"aaaaa").unwrap();
        let second = make_block(&mut img, b"bbbbb").unwrap();
        let first = link_tail(&mut img, first, second).unwrap();

        chain_overwrite(&mut img, first, 3, b"XXXX").unwrap();
        let mut buf = [0_u8; 10];
        chain_read(&img, first, 10, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaXXXXbbb");
    }

    #[test]
    fn truncate_grow_zero_fills() {
        let mut region = vec![0_u8; 8192];
        let mut img = image(&mut region);
        let first = make_block(&mut img, b"abc").unwrap();
        let first = chain_truncate(&mut img, first, 3, 8).unwrap();

        let mut buf = [0xFF_u8; 8];
        assert_eq!(chain_read(&img, first, 8, 0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"abc\0\0\0\0\0");
    }

    #[test]
    fn truncate_from_empty_allocates_zeros() {
        let mut region = vec![0_u8; 4096];
        let mut img = image(&mut region);
        let first = chain_truncate(&mut img, ImageOffset::NULL, 0, 8).unwrap();
        let mut buf = [0xFF_u8; 8];
        assert_eq!(chain_read(&img, first, 8, 0, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0_u8; 8]);
    }

    #[test]
    fn truncate_shrink_inside_a_block() {
        let mut region = vec![0_u8; 8192];
        let mut img = image(&mut region);
        let first = make_block(&mut img, b"abcdefgh").unwrap();
        let second = make_block(&mut img, b"ijklmnop").unwrap();
        let first = link_tail(&mut img, first, second).unwrap();

        let first = chain_truncate(&mut img, first, 16, 3).unwrap();
        let block = read_block(&img, first).unwrap();
        assert_eq!(block.size, 3);
        assert!(block.next.is_null());

        let mut buf = [0_u8; 3];
        assert_eq!(chain_read(&img, first, 3, 0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn truncate_shrink_on_block_boundary() {
        let mut region = vec![0_u8; 8192];
        let mut img = image(&mut region);
        let first = make_block(&mut img, b"abcde").unwrap();
        let second = make_block(&mut img, b"fghij").unwrap();
        let first = link_tail(&mut img, first, second).unwrap();

        let first = chain_truncate(&mut img, first, 10, 5).unwrap();
        let block = read_block(&img, first).unwrap();
        assert_eq!(block.size, 5);
        assert!(block.next.is_null());
    }

    #[test]
    fn truncate_to_zero_frees_everything() {
        let mut region = vec![0_u8; 8192];
        let mut img = image(&mut region);
        let baseline = total_free(&img).unwrap();

        let first = make_block(&mut img, b"abcde").unwrap();
        let second = make_block(&mut img, b"fghij").unwrap();
        let first = link_tail(&mut img, first, second).unwrap();

        let first = chain_truncate(&mut img, first, 10, 0).unwrap();
        assert!(first.is_null());
        assert_eq!(total_free(&img).unwrap(), baseline);
    }

    #[test]
    fn free_chain_returns_all_bytes() {
        let mut region = vec![0_u8; 8192];
        let mut img = image(&mut region);
        let baseline = total_free(&img).unwrap();

        let first = make_block(&mut img, &[7_u8; 100]).unwrap();
        let second = make_block(&mut img, &[8_u8; 200]).unwrap();
        let first = link_tail(&mut img, first, second).unwrap();
        free_chain(&mut img, first).unwrap();

        assert_eq!(total_free(&img).unwrap(), baseline);
    }

    #[test]
    fn failed_make_block_leaks_nothing() {
        let mut region = vec![0_u8; 256];
        let mut img = image(&mut region);
        let baseline = total_free(&img).unwrap();
        assert!(matches!(
            make_block(&mut img, &[0_u8; 4096]),
            Err(MemfsError::NoSpace)
        ));
        assert_eq!(total_free(&img).unwrap(), baseline);
    }
}
