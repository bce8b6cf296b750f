//! Whole-image invariant checking.
//!
//! Walks the free list and the directory tree and verifies the structural
//! invariants every reachable image must uphold: an address-sorted,
//! non-adjacent free list; the accounting identity `free bytes + reachable
//! allocated bytes == usable bytes`; child counts matching their arrays with
//! unique names; and file sizes matching their block chains. Soft violations
//! become findings; only an image too broken to walk at all aborts the scan.

use crate::inode::{Inode, InodePayload};
use memfs_error::Result;
use memfs_image::Image;
use memfs_types::{ImageOffset, ALLOC_HEADER_SIZE, INODE_SIZE};
use serde::Serialize;
use std::collections::HashSet;

/// One structural violation, anchored at an image offset.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub offset: u64,
    pub detail: String,
}

/// Result of a whole-image scan.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub usable_bytes: u64,
    pub free_bytes: u64,
    pub reachable_bytes: u64,
    pub inode_count: u64,
    pub directory_count: u64,
    pub file_count: u64,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

struct Scan<'i, 'a> {
    img: &'i Image<'a>,
    visited: HashSet<u64>,
    reachable: u64,
    inode_count: u64,
    directory_count: u64,
    file_count: u64,
    findings: Vec<Finding>,
}

impl Scan<'_, '_> {
    fn finding(&mut self, offset: ImageOffset, detail: impl Into<String>) {
        self.findings.push(Finding {
            offset: offset.0,
            detail: detail.into(),
        });
    }

    /// Account for the allocation backing `user_off`, header inclusive.
    ///
    /// Returns the user-visible size, or `None` after recording a finding.
    fn account(&mut self, user_off: ImageOffset, what: &str) -> Option<u64> {
        match memfs_alloc::user_size(self.img, user_off) {
            Ok(size) => {
                self.reachable += size + ALLOC_HEADER_SIZE;
                Some(size)
            }
            Err(err) => {
                self.finding(user_off, format!("{what}: unreadable allocation ({err})"));
                None
            }
        }
    }

    fn visit_inode(&mut self, off: ImageOffset, path: &str) {
        if !self.visited.insert(off.0) {
            self.finding(off, format!("{path}: record visited twice (cycle)"));
            return;
        }
        let node = match Inode::read_at(self.img, off) {
            Ok(node) => node,
            Err(err) => {
                self.finding(off, format!("{path}: unreadable inode ({err})"));
                return;
            }
        };
        self.inode_count += 1;

        match node.payload {
            InodePayload::Directory {
                child_count,
                children,
            } => self.visit_directory(path, child_count, children),
            InodePayload::RegularFile { size, first_block } => {
                self.visit_file(off, path, size, first_block);
            }
        }
    }

    fn visit_directory(&mut self, path: &str, child_count: u64, children: ImageOffset) {
        self.directory_count += 1;

        if child_count == 0 {
            if !children.is_null() {
                self.finding(children, format!("{path}: empty directory keeps an array"));
            }
            return;
        }
        if children.is_null() {
            self.finding(
                ImageOffset::NULL,
                format!("{path}: {child_count} children but no array"),
            );
            return;
        }

        let Some(array_len) = self.account(children, path) else {
            return;
        };
        let needed = child_count.saturating_mul(INODE_SIZE);
        if array_len < needed {
            self.finding(
                children,
                format!(
                    "{path}: children array holds {array_len} bytes, {needed} needed for {child_count} records"
                ),
            );
            return;
        }

        let mut names = HashSet::new();
        for index in 0..child_count {
            let slot = ImageOffset(children.0 + index * INODE_SIZE);
            if let Ok(child) = Inode::read_at(self.img, slot) {
                if !names.insert(child.name.clone()) {
                    self.finding(slot, format!("{path}: duplicate child name {:?}", child.name));
                }
                let child_path = if path == "/" {
                    format!("/{}", child.name)
                } else {
                    format!("{path}/{}", child.name)
                };
                self.visit_inode(slot, &child_path);
            } else {
                self.finding(slot, format!("{path}: unreadable child record"));
            }
        }
    }

    fn visit_file(&mut self, off: ImageOffset, path: &str, size: u64, first_block: ImageOffset) {
        self.file_count += 1;

        let mut chain_total = 0_u64;
        let mut cur = first_block;
        while !cur.is_null() {
            if !self.visited.insert(cur.0) {
                self.finding(cur, format!("{path}: file chain cycles"));
                return;
            }
            if self.account(cur, path).is_none() {
                return;
            }
            let block = match crate::file::read_block(self.img, cur) {
                Ok(block) => block,
                Err(err) => {
                    self.finding(cur, format!("{path}: unreadable file block ({err})"));
                    return;
                }
            };
            if block.size == 0 {
                self.finding(cur, format!("{path}: zero-length file block"));
            }
            if block.data.is_null() {
                self.finding(cur, format!("{path}: file block without payload"));
            } else if let Some(payload_len) = self.account(block.data, path) {
                if payload_len < block.size {
                    self.finding(
                        block.data,
                        format!(
                            "{path}: payload holds {payload_len} bytes, block claims {}",
                            block.size
                        ),
                    );
                }
            }
            chain_total += block.size;
            cur = block.next;
        }

        if chain_total != size {
            self.finding(
                off,
                format!("{path}: size {size} but chain holds {chain_total} bytes"),
            );
        }
    }
}

/// Scan an image and report every invariant violation found.
pub fn check_image(img: &Image<'_>) -> Result<CheckReport> {
    let mut scan = Scan {
        img,
        visited: HashSet::new(),
        reachable: 0,
        inode_count: 0,
        directory_count: 0,
        file_count: 0,
        findings: Vec::new(),
    };

    // Free list: sortedness is enforced by the walk itself; adjacency means
    // a missed merge.
    let free = memfs_alloc::free_list(img)?;
    for pair in free.windows(2) {
        let (a_off, a_size) = pair[0];
        let (b_off, _) = pair[1];
        if a_off.0 + a_size == b_off.0 {
            scan.finding(b_off, "physically adjacent free blocks not merged");
        }
    }
    let free_bytes = free.iter().map(|(_, size)| *size).sum::<u64>();

    let root = img.root();
    if root.is_null() {
        scan.finding(ImageOffset::NULL, "image has no root inode");
    } else {
        scan.account(root, "/");
        scan.visit_inode(root, "/");
    }

    let usable_bytes = img.usable_size();
    if free_bytes + scan.reachable != usable_bytes {
        scan.finding(
            ImageOffset::NULL,
            format!(
                "accounting mismatch: {free_bytes} free + {} reachable != {usable_bytes} usable",
                scan.reachable
            ),
        );
    }

    Ok(CheckReport {
        usable_bytes,
        free_bytes,
        reachable_bytes: scan.reachable,
        inode_count: scan.inode_count,
        directory_count: scan.directory_count,
        file_count: scan.file_count,
        findings: scan.findings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Fs;
    use memfs_types::INO_WORD_A;

    #[test]
    fn fresh_image_is_clean() {
        let mut region = vec![0_u8; 4096];
        let fs = Fs::open(&mut region).unwrap();
        let report = check_image(fs.image()).unwrap();
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.inode_count, 1);
        assert_eq!(report.directory_count, 1);
        assert_eq!(
            report.free_bytes + report.reachable_bytes,
            report.usable_bytes
        );
    }

    #[test]
    fn populated_image_is_clean() {
        let mut region = vec![0_u8; 64 * 1024];
        let mut fs = Fs::open(&mut region).unwrap();
        fs.mkdir("/docs").unwrap();
        fs.mknod("/docs/a.txt").unwrap();
        fs.write("/docs/a.txt", b"hello world", 0).unwrap();
        fs.mknod("/b").unwrap();
        fs.truncate("/b", 100).unwrap();

        let report = check_image(fs.image()).unwrap();
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.file_count, 2);
        assert_eq!(report.directory_count, 2);
        assert_eq!(
            report.free_bytes + report.reachable_bytes,
            report.usable_bytes
        );
    }

    #[test]
    fn corrupted_size_is_reported() {
        let mut region = vec![0_u8; 16 * 1024];
        let mut fs = Fs::open(&mut region).unwrap();
        fs.mknod("/f").unwrap();
        fs.write("/f", b"0123456789", 0).unwrap();

        // Lie about the file's size directly in its record.
        let root = fs.image().root();
        let slot = {
            let d = crate::dir::read_dir(fs.image(), root).unwrap();
            crate::dir::lookup(fs.image(), &d, "f").unwrap().unwrap().1
        };
        drop(fs);
        let mut fs2 = Fs::open(&mut region).unwrap();
        fs2.img
            .write_u64(ImageOffset(slot.0 + INO_WORD_A), 99)
            .unwrap();

        let report = check_image(fs2.image()).unwrap();
        assert!(!report.is_clean());
        assert!(report
            .findings
            .iter()
            .any(|f| f.detail.contains("chain holds")));
    }
}
