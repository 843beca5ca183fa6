//! Component B: attribute mapping and name normalization.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime};

use fuser::{FileAttr, FileType};

/// Entry and attribute replies stay valid for this long before the kernel
/// re-queries; the fixed-ownership policy never changes mid-mount, so a
/// generous TTL is fine.
pub const ATTR_TTL: Duration = Duration::from_secs(10);

/// Regular-file / directory permission bits the policy clamps every
/// reported mode down to. Anything executable on the backing store is
/// reported `0775`; everything else is `0664`.
const CLAMPED_EXEC_PERM: u16 = 0o775;
const CLAMPED_NOEXEC_PERM: u16 = 0o664;

/// Map a `readdir(3)`-style (non-following) file type, as reported by
/// `std::fs::DirEntry::file_type`, to the protocol's `FileType`.
pub fn file_type_from_std(ft: std::fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Clamp the permission bits the policy exposes to the kernel: `0775` if the
/// backing entry has any executable bit set, `0664` otherwise. Type bits are
/// never touched here; `fuser::FileAttr` keeps them in a separate `kind`
/// field, so "preserving file-type bits" falls out for free.
fn clamp_perm(mode: u32) -> u16 {
    if mode & 0o111 != 0 {
        CLAMPED_EXEC_PERM
    } else {
        CLAMPED_NOEXEC_PERM
    }
}

/// Translate a backing `lstat` result into the attribute record the kernel
/// sees, applying the fixed-ownership / clamped-mode policy. `nid` replaces
/// the backing inode number; the kernel keys its own cache on the protocol
/// identifier, not the real inode.
pub fn map_attr(nid: u64, meta: &std::fs::Metadata, gid: u32) -> FileAttr {
    let mode = meta.mode();
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    FileAttr {
        ino: nid,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(mtime),
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: file_type_from_mode(mode),
        perm: clamp_perm(mode),
        nlink: meta.nlink() as u32,
        uid: 0,
        gid,
        rdev: meta.rdev() as u32,
        flags: 0,
        blksize: meta.blksize() as u32,
    }
}

/// Lower-case the ASCII letters of `name`, leaving every other byte (and
/// every non-ASCII byte of a multi-byte UTF-8 sequence) untouched. Applying
/// this twice is a no-op, which is what lets the repair pass and the
/// outgoing-path folding in [`crate::pathbuf`] compose safely.
pub fn normalize_name(name: &OsStr) -> OsString {
    let folded: Vec<u8> = name
        .as_bytes()
        .iter()
        .map(|&b| if b.is_ascii_uppercase() { b.to_ascii_lowercase() } else { b })
        .collect();
    OsString::from_vec(folded)
}

/// Whether [`normalize_name`] would change `name`. Lets the repair walk
/// skip issuing a no-op rename.
pub fn name_needs_normalizing(name: &OsStr) -> bool {
    name.as_bytes().iter().any(|b| b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let name = OsStr::new("Foo.TXT");
        let once = normalize_name(name);
        let twice = normalize_name(&once);
        assert_eq!(once, twice);
        assert_eq!(once, OsString::from("foo.txt"));
    }

    #[test]
    fn normalize_only_touches_ascii_letters() {
        let name = OsStr::new("IMG_0001-Résumé.JPG");
        let folded = normalize_name(name);
        assert_eq!(folded, OsString::from("img_0001-Résumé.jpg"));
    }

    #[test]
    fn needs_normalizing_detects_uppercase() {
        assert!(name_needs_normalizing(OsStr::new("Foo")));
        assert!(!name_needs_normalizing(OsStr::new("foo")));
        assert!(!name_needs_normalizing(OsStr::new("123_-.txt")));
    }

    #[test]
    fn clamp_perm_picks_exec_or_noexec() {
        assert_eq!(clamp_perm(0o100644), CLAMPED_NOEXEC_PERM);
        assert_eq!(clamp_perm(0o100755), CLAMPED_EXEC_PERM);
        assert_eq!(clamp_perm(0o100700), CLAMPED_EXEC_PERM);
    }

    #[test]
    fn file_type_mapping_preserves_type_bits() {
        assert_eq!(file_type_from_mode(libc::S_IFDIR as u32 | 0o755), FileType::Directory);
        assert_eq!(file_type_from_mode(libc::S_IFREG as u32 | 0o644), FileType::RegularFile);
        assert_eq!(file_type_from_mode(libc::S_IFLNK as u32 | 0o777), FileType::Symlink);
    }
}
