//! Component F: the dispatcher. One `fuser::Filesystem` method per opcode
//! this daemon supports. Everything it doesn't override falls through to
//! `fuser`'s default implementations, which reply `-ENOSYS` (symlink, link,
//! xattrs, locking, fsync, ...), matching the "unknown / unimplemented" row
//! of the opcode table without per-opcode boilerplate.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Duration;

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{c_int, EBADF, EINVAL, ENAMETOOLONG, ENOENT};

use crate::attrs::{file_type_from_std, map_attr, ATTR_TTL};
use crate::handles::{DirEntry, Handle, HandleTable};
use crate::node::{NodeCache, NodeRef};
use crate::pathbuf::build_backing_path;

/// Negotiated with the kernel at INIT time.
const MAX_WRITE: u32 = 262_144;
const MAX_BACKGROUND: u16 = 32;
const CONGESTION_THRESHOLD: u16 = 32;

/// Reads larger than this are rejected with `EINVAL`.
const MAX_READ_SIZE: u32 = 131_072;

/// READDIR reports a sentinel inode for every entry; the kernel resolves the
/// real node id through a subsequent LOOKUP rather than trusting this field.
const READDIR_INO_PLACEHOLDER: u64 = u64::MAX;

pub struct Sdcardfs {
    cache: NodeCache,
    handles: HandleTable,
    gid: u32,
    fold_case: bool,
}

impl Sdcardfs {
    pub fn new(backing_root: OsString, gid: u32, fold_case: bool) -> Self {
        Sdcardfs {
            cache: NodeCache::new(backing_root),
            handles: HandleTable::new(),
            gid,
            fold_case,
        }
    }

    fn stat_and_map(&self, path: &Path, nid: u64) -> std::io::Result<FileAttr> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(map_attr(nid, &meta, self.gid))
    }

    /// Shared tail of LOOKUP and the success path of MKNOD/MKDIR: stat the
    /// freshly-named entry, cache it, bump its lookup reference, and reply
    /// with an entry record.
    fn lookup_style_reply(&mut self, parent: &NodeRef, name: &OsStr, reply: ReplyEntry) {
        let path = match build_backing_path(parent, Some(name), self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };

        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => return reply.error(errno_of(&err)),
        };

        let child = self.cache.get_or_create_child(parent, name);
        let attr = map_attr(child.borrow().nid(), &meta, self.gid);
        let generation = child.borrow().generation();
        reply.entry(&ATTR_TTL, &attr, generation);
        // Bumped after the reply is handed off. `fuser` does not give us a
        // way to observe a failed reply write, so there is nothing to roll
        // back from here (see DESIGN.md).
        self.cache.add_lookup_ref(&child);
    }
}

fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn path_to_cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

impl Filesystem for Sdcardfs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        let _ = config.set_max_write(MAX_WRITE);
        let _ = config.set_max_background(MAX_BACKGROUND);
        let _ = config.set_congestion_threshold(CONGESTION_THRESHOLD);
        let _ = config.add_capabilities(fuser::consts::FUSE_CAP_ATOMIC_O_TRUNC);
        log::info!(
            "mounted, max_write={} max_background={} congestion_threshold={}",
            MAX_WRITE,
            MAX_BACKGROUND,
            CONGESTION_THRESHOLD
        );
        Ok(())
    }

    fn destroy(&mut self) {
        log::info!("unmounting");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        log::debug!("lookup(parent={}, name={:?})", parent, name);
        let Some(parent_node) = self.cache.resolve(parent) else {
            return reply.error(ENOENT);
        };
        self.lookup_style_reply(&parent_node, name, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        log::debug!("forget(ino={}, nlookup={})", ino, nlookup);
        if let Some(node) = self.cache.resolve(ino) {
            self.cache.release(node, nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        log::debug!("getattr(ino={})", ino);
        let Some(node) = self.cache.resolve(ino) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&node, None, self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };
        match self.stat_and_map(&path, ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    /// chmod/chown are always silently dropped; only a `SIZE` change is
    /// actually applied to the backing file.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        log::debug!("setattr(ino={}, size={:?})", ino, size);
        let Some(node) = self.cache.resolve(ino) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&node, None, self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };

        if let Some(size) = size {
            let file = match std::fs::OpenOptions::new().write(true).open(&path) {
                Ok(file) => file,
                Err(err) => return reply.error(errno_of(&err)),
            };
            if let Err(err) = file.set_len(size) {
                return reply.error(errno_of(&err));
            }
        }

        match self.stat_and_map(&path, ino) {
            Ok(attr) => reply.attr(&Duration::new(0, 0), &attr),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        log::debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let Some(parent_node) = self.cache.resolve(parent) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&parent_node, Some(name), self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };
        let Some(cpath) = path_to_cstring(&path) else {
            return reply.error(EINVAL);
        };

        // Mode clamping precedes the backing call so the entry already
        // stats back to the policy's permission bits.
        let clamped_mode = (mode & libc::S_IFMT as u32) | 0o664;
        let rc = unsafe { libc::mknod(cpath.as_ptr(), clamped_mode, rdev as libc::dev_t) };
        if rc != 0 {
            return reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }

        self.lookup_style_reply(&parent_node, name, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        log::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let Some(parent_node) = self.cache.resolve(parent) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&parent_node, Some(name), self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };
        let Some(cpath) = path_to_cstring(&path) else {
            return reply.error(EINVAL);
        };

        let rc = unsafe { libc::mkdir(cpath.as_ptr(), 0o775) };
        if rc != 0 {
            return reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }

        self.lookup_style_reply(&parent_node, name, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        log::debug!("unlink(parent={}, name={:?})", parent, name);
        let Some(parent_node) = self.cache.resolve(parent) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&parent_node, Some(name), self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };
        match std::fs::remove_file(&path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        log::debug!("rmdir(parent={}, name={:?})", parent, name);
        let Some(parent_node) = self.cache.resolve(parent) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&parent_node, Some(name), self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };
        match std::fs::remove_dir(&path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    /// The cache is reparented before the backing rename is attempted, which
    /// means a failing backing rename leaves the cache ahead of the backing
    /// store. Kept deliberately rather than reordered or rolled back, see
    /// DESIGN.md.
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        log::debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let Some(old_parent) = self.cache.resolve(parent) else {
            return reply.error(ENOENT);
        };
        let Some(new_parent) = self.cache.resolve(newparent) else {
            return reply.error(ENOENT);
        };
        let Some(target) = old_parent.borrow().child(name) else {
            return reply.error(ENOENT);
        };

        let old_path = match build_backing_path(&target, None, self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };
        let new_path = match build_backing_path(&new_parent, Some(newname), self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };

        self.cache.reparent(&target, &new_parent, newname.to_os_string());

        match std::fs::rename(&old_path, &new_path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        log::debug!("open(ino={}, flags={:#x})", ino, flags);
        let Some(node) = self.cache.resolve(ino) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&node, None, self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };

        let mut options = std::fs::OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => {
                options.write(true);
            }
            libc::O_RDWR => {
                options.read(true).write(true);
            }
            _ => {
                options.read(true);
            }
        }
        if flags & libc::O_APPEND != 0 {
            options.append(true);
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }

        match options.open(&path) {
            Ok(file) => {
                let fh = self.handles.insert(Handle::File(file));
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        log::debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if size > MAX_READ_SIZE {
            return reply.error(EINVAL);
        }
        let Some(Handle::File(file)) = self.handles.get(fh) else {
            return reply.error(EBADF);
        };

        let mut buf = vec![0u8; size as usize];
        match file.read_at(&mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    /// Writes exactly one reply. A known quirk elsewhere sends a normal
    /// `write_out` followed by a spurious `-ENOSYS` on the same request;
    /// that is not reproduced here, see DESIGN.md.
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        log::debug!(
            "write(ino={}, fh={}, offset={}, len={})",
            ino, fh, offset, data.len()
        );
        let Some(Handle::File(file)) = self.handles.get(fh) else {
            return reply.error(EBADF);
        };

        match file.write_at(data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        log::debug!("flush(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        log::debug!("release(ino={}, fh={})", ino, fh);
        self.handles.remove(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        log::debug!("opendir(ino={}, flags={:#x})", ino, flags);
        let Some(node) = self.cache.resolve(ino) else {
            return reply.error(ENOENT);
        };
        let path = match build_backing_path(&node, None, self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };

        let read_dir = match std::fs::read_dir(&path) {
            Ok(read_dir) => read_dir,
            Err(err) => return reply.error(errno_of(&err)),
        };

        let mut entries = vec![
            DirEntry { kind: fuser::FileType::Directory, name: OsString::from(".") },
            DirEntry { kind: fuser::FileType::Directory, name: OsString::from("..") },
        ];
        for entry in read_dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("opendir({}): skipping unreadable entry: {}", ino, err);
                    continue;
                }
            };
            let kind = match entry.file_type() {
                Ok(ft) => file_type_from_std(ft),
                Err(err) => {
                    log::warn!("opendir({}): stat failed for {:?}: {}", ino, entry.path(), err);
                    continue;
                }
            };
            let name = if self.fold_case {
                crate::attrs::normalize_name(&entry.file_name())
            } else {
                entry.file_name()
            };
            entries.push(DirEntry { kind, name });
        }

        let fh = self.handles.insert(Handle::Dir(entries));
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        log::debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        let Some(Handle::Dir(entries)) = self.handles.get(fh) else {
            return reply.error(EBADF);
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let next_offset = (i + 1) as i64;
            if reply.add(READDIR_INO_PLACEHOLDER, next_offset, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        log::debug!("releasedir(ino={}, fh={})", ino, fh);
        self.handles.remove(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let root = self.cache.root();
        let path = match build_backing_path(&root, None, self.fold_case) {
            Ok(path) => path,
            Err(_) => return reply.error(ENAMETOOLONG),
        };
        let Some(cpath) = path_to_cstring(&path) else {
            return reply.error(EINVAL);
        };

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
        if rc != 0 {
            return reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }

        reply.statfs(
            stat.f_blocks,
            stat.f_bfree,
            stat.f_bavail,
            stat.f_files,
            stat.f_ffree,
            stat.f_bsize as u32,
            stat.f_namemax as u32,
            stat.f_frsize as u32,
        );
    }
}

// Opcodes this daemon does not support (symlink, link, readlink, xattrs,
// locking, fsync(dir), ioctl, bmap, poll, fallocate, lseek,
// copy_file_range, access, create, readdirplus, batch_forget) are left on
// `fuser`'s default trait methods, which reply `-ENOSYS`.
