//! Part of Component G: the optional `-f` pre-mount repair walk.
//!
//! Recursively normalizes ownership and filename case across the backing
//! tree so that outgoing path folding (see [`crate::pathbuf`]) and the
//! fixed-ownership attribute policy agree with what's actually on disk.

use std::fs;
use std::path::Path;

use crate::attrs::{name_needs_normalizing, normalize_name};
use crate::pathbuf::MAX_PATH_LEN;

pub fn repair_tree(root: &Path, uid: u32, gid: u32) {
    visit(root, uid, gid);
}

fn visit(dir: &Path, uid: u32, gid: u32) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("repair: can't read {:?}: {}", dir, err);
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("repair: bad entry under {:?}: {}", dir, err);
                continue;
            }
        };

        let mut path = entry.path();
        if path.as_os_str().len() > MAX_PATH_LEN {
            log::warn!("repair: skipping oversize path {:?}", path);
            continue;
        }

        if let Err(err) = std::os::unix::fs::chown(&path, Some(uid), Some(gid)) {
            log::warn!("repair: chown {:?} failed: {}", path, err);
        }

        let file_name = entry.file_name();
        if name_needs_normalizing(&file_name) {
            let folded = normalize_name(&file_name);
            let renamed = dir.join(&folded);
            match fs::rename(&path, &renamed) {
                Ok(()) => {
                    log::info!("repair: renamed {:?} -> {:?}", path, renamed);
                    path = renamed;
                }
                Err(err) => {
                    log::warn!("repair: rename {:?} -> {:?} failed: {}", path, renamed, err);
                }
            }
        }

        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => visit(&path, uid, gid),
            Ok(_) => {}
            Err(err) => log::warn!("repair: can't stat {:?}: {}", path, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn repair_lowercases_names_and_descends() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("DIR");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("File.TXT"), b"hi").unwrap();

        repair_tree(dir.path(), nix_current_uid(), nix_current_gid());

        let lower_dir = dir.path().join("dir");
        assert!(lower_dir.is_dir());
        assert!(lower_dir.join("file.txt").is_file());
    }

    #[test]
    fn repair_chowns_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, b"hi").unwrap();

        let uid = nix_current_uid();
        let gid = nix_current_gid();
        repair_tree(dir.path(), uid, gid);

        let meta = fs::metadata(&file).unwrap();
        assert_eq!(meta.uid(), uid);
        assert_eq!(meta.gid(), gid);
    }

    fn nix_current_uid() -> u32 {
        unsafe { libc::getuid() }
    }

    fn nix_current_gid() -> u32 {
        unsafe { libc::getgid() }
    }
}
