//! Component A: reconstructing absolute backing paths from a cached node.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use crate::attrs::normalize_name;
use crate::node::NodeRef;

/// Assembling a path past this length fails with `ENAMETOOLONG` at the call
/// site rather than growing paths without bound.
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Debug)]
pub struct PathTooLong;

/// Walk `node`'s parent chain up to the root, optionally appending one more
/// path component, and return the absolute backing path.
///
/// When `fold_case` is set, every component below the root is lower-cased
/// (ASCII only) before being joined in. The root's name, which is the
/// literal backing directory passed on the command line, is always copied
/// verbatim. This is the "outgoing path" referred to in the case-folding
/// asymmetry design note: it governs what we hand to the backing filesystem
/// and to the kernel, not how incoming names are matched against the cache.
pub fn build_backing_path(
    node: &NodeRef,
    extra: Option<&OsStr>,
    fold_case: bool,
) -> Result<PathBuf, PathTooLong> {
    let mut components: Vec<OsString> = Vec::new();
    if let Some(extra) = extra {
        components.push(maybe_fold(extra, fold_case));
    }

    let mut current = node.clone();
    loop {
        let parent = current.borrow().parent();
        match parent {
            Some(parent) => {
                components.push(maybe_fold(current.borrow().name(), fold_case));
                current = parent;
            }
            None => {
                // `current` is the root; its name is the absolute backing
                // path already, copied verbatim.
                components.push(current.borrow().name().to_os_string());
                break;
            }
        }
    }
    components.reverse();

    let mut bytes: Vec<u8> = Vec::new();
    for (i, component) in components.iter().enumerate() {
        if i > 0 {
            bytes.push(b'/');
        }
        bytes.extend_from_slice(component.as_bytes());
    }

    if bytes.len() > MAX_PATH_LEN {
        return Err(PathTooLong);
    }

    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

fn maybe_fold(name: &OsStr, fold_case: bool) -> OsString {
    if fold_case {
        normalize_name(name)
    } else {
        name.to_os_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeCache;

    #[test]
    fn root_path_is_copied_verbatim() {
        let cache = NodeCache::new(OsString::from("/backing/sdcard"));
        let root = cache.root();
        let path = build_backing_path(&root, None, false).unwrap();
        assert_eq!(path, PathBuf::from("/backing/sdcard"));
    }

    #[test]
    fn nested_path_joins_components() {
        let mut cache = NodeCache::new(OsString::from("/backing"));
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("A"));
        let path = build_backing_path(&a, Some(OsStr::new("B")), false).unwrap();
        assert_eq!(path, PathBuf::from("/backing/A/B"));
    }

    #[test]
    fn fold_case_lowercases_non_root_segments_only() {
        let mut cache = NodeCache::new(OsString::from("/Backing"));
        let root = cache.root();
        let a = cache.get_or_create_child(&root, OsStr::new("Foo"));
        let path = build_backing_path(&a, Some(OsStr::new("BAR.TXT")), true).unwrap();
        assert_eq!(path, PathBuf::from("/Backing/foo/bar.txt"));
    }

    #[test]
    fn oversized_path_is_rejected() {
        let mut cache = NodeCache::new(OsString::from("/backing"));
        let root = cache.root();
        let long_name = "a".repeat(MAX_PATH_LEN);
        let child = cache.get_or_create_child(&root, OsStr::new(&long_name));
        assert!(build_backing_path(&child, None, false).is_err());
    }

    #[test]
    fn path_exactly_at_limit_succeeds() {
        let mut cache = NodeCache::new(OsString::from("/b"));
        let root = cache.root();
        // "/b/" + name must total exactly MAX_PATH_LEN
        let name_len = MAX_PATH_LEN - "/b/".len();
        let name = "a".repeat(name_len);
        let child = cache.get_or_create_child(&root, OsStr::new(&name));
        let path = build_backing_path(&child, None, false).unwrap();
        assert_eq!(path.as_os_str().as_bytes().len(), MAX_PATH_LEN);
    }
}
