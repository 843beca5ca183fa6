//! Component D: the open-handle table.
//!
//! Handle tokens live in their own id space, disjoint from node ids.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;

use fuser::FileType;

/// One entry materialized at `OPENDIR` time and served back by offset on
/// each `READDIR` call. `std::fs::read_dir` doesn't expose a seekable
/// directory stream the way `readdir(3)` does, so the whole listing is read
/// up front and walked by index.
pub struct DirEntry {
    pub kind: FileType,
    pub name: OsString,
}

pub enum Handle {
    File(File),
    Dir(Vec<DirEntry>),
}

pub struct HandleTable {
    next_fh: u64,
    handles: HashMap<u64, Handle>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_fh: 1,
            handles: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: Handle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<&Handle> {
        self.handles.get(&fh)
    }

    pub fn remove(&mut self, fh: u64) -> Option<Handle> {
        self.handles.remove(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_disjoint_from_low_nids() {
        let mut table = HandleTable::new();
        let a = table.insert(Handle::Dir(Vec::new()));
        let b = table.insert(Handle::Dir(Vec::new()));
        assert_ne!(a, b);
        assert!(table.get(a).is_some());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn remove_drops_the_handle() {
        let mut table = HandleTable::new();
        let fh = table.insert(Handle::Dir(Vec::new()));
        assert!(table.remove(fh).is_some());
        assert!(table.get(fh).is_none());
    }
}
