//! Path resolution.
//!
//! Paths are absolute, `/`-separated, with empty components ignored, so
//! `//a///b` resolves like `/a/b`. Resolution walks the on-image tree from
//! the root and never mutates anything; it is the canonical source of the
//! not-found and not-a-directory errors the operations surface.

use crate::inode::{Inode, InodePayload};
use memfs_error::{MemfsError, Result};
use memfs_image::Image;
use memfs_types::{ImageOffset, INODE_SIZE, NAME_MAX};

/// Split an absolute path into normalized components.
pub fn split_components(path: &str) -> Result<Vec<&str>> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(MemfsError::Invalid(format!(
            "path {path:?} is not absolute"
        )));
    };
    let mut components = Vec::new();
    for component in rest.split('/') {
        if component.is_empty() {
            continue;
        }
        if component.len() > NAME_MAX {
            return Err(MemfsError::NameTooLong);
        }
        components.push(component);
    }
    Ok(components)
}

/// Split a path into its parent's components and its final name.
///
/// The root has no parent entry, so `/` is reported as not found.
pub fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut components = split_components(path)?;
    match components.pop() {
        Some(name) => Ok((components, name)),
        None => Err(MemfsError::NotFound(path.to_owned())),
    }
}

/// Resolve a path to the offset of its inode record.
pub fn resolve(img: &Image<'_>, path: &str) -> Result<ImageOffset> {
    let components = split_components(path)?;
    resolve_components(img, &components, path)
}

/// Resolve pre-split components, using `path` for error context.
pub fn resolve_components(
    img: &Image<'_>,
    components: &[&str],
    path: &str,
) -> Result<ImageOffset> {
    let root = img.root();
    if root.is_null() {
        return Err(MemfsError::BadImage("image has no root inode".to_owned()));
    }

    let mut cur = root;
    for component in components {
        let node = Inode::read_at(img, cur)?;
        let InodePayload::Directory {
            child_count,
            children,
        } = node.payload
        else {
            return Err(MemfsError::NotDirectory);
        };
        match lookup_child(img, child_count, children, component)? {
            Some((_, child)) => cur = child,
            None => return Err(MemfsError::NotFound(path.to_owned())),
        }
    }
    Ok(cur)
}

/// Linear scan of a children array for a name match.
///
/// Returns the slot index and record offset. Indexes are invalidated by any
/// directory mutation and must not be held across one.
pub fn lookup_child(
    img: &Image<'_>,
    child_count: u64,
    children: ImageOffset,
    name: &str,
) -> Result<Option<(u64, ImageOffset)>> {
    if child_count == 0 || children.is_null() {
        return Ok(None);
    }
    for index in 0..child_count {
        let slot = ImageOffset(children.0 + index * INODE_SIZE);
        let node = Inode::read_at(img, slot)?;
        if node.name == name {
            return Ok(Some((index, slot)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_normalizes_separators() {
        assert_eq!(split_components("/").unwrap(), Vec::<&str>::new());
        assert_eq!(split_components("/a/b").unwrap(), vec!["a", "b"]);
        assert_eq!(split_components("//a///b/").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn split_rejects_relative_paths() {
        assert!(matches!(
            split_components("a/b"),
            Err(MemfsError::Invalid(_))
        ));
        assert!(matches!(split_components(""), Err(MemfsError::Invalid(_))));
    }

    #[test]
    fn split_rejects_long_components() {
        let long = format!("/{}", "x".repeat(NAME_MAX + 1));
        assert!(matches!(
            split_components(&long),
            Err(MemfsError::NameTooLong)
        ));
    }

    #[test]
    fn split_parent_of_root_is_not_found() {
        assert!(matches!(split_parent("/"), Err(MemfsError::NotFound(_))));
        let (parent, name) = split_parent("/a/b/c").unwrap();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(name, "c");
        let (parent, name) = split_parent("/top").unwrap();
        assert!(parent.is_empty());
        assert_eq!(name, "top");
    }
}
