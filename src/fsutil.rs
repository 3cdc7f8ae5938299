//! Filesystem helpers for Retrace
//!
//! This module wraps the low-level operations the rest of the crate needs on
//! the local filesystem: normalising `lstat` into a [`FileAttrs`], hashing
//! content, applying attributes, durable writes and special-file creation.
//!
//! ## Categories of Utilities
//!
//! ### Stat
//! - [`stat_attrs`] turns `lstat` output into typed attributes.
//!   A path that does not exist yields [`FileAttrs::Missing`] instead of an error.
//!
//! ### Content
//! - SHA-256 fingerprints of in-memory data
//! - Durable writes (write, fsync, optional directory fsync)
//!
//! ### Attributes
//! - Permission bits, modification time, ownership and extended attributes,
//!   applied in an order that keeps later steps from undoing earlier ones
//!
//! ### Special files
//! - Symlinks, named pipes and device nodes
//!
//! ## Example
//!
//! ```rust,no_run
//! use retrace::fsutil::{stat_attrs, hash_data};
//! use std::path::Path;
//!
//! # fn example() -> std::io::Result<()> {
//! let attrs = stat_attrs(Path::new("notes.txt"), false)?;
//! println!("{:?} ({} bytes)", attrs.file_type(), attrs.size());
//! println!("{}", hash_data(b"hello"));
//! # Ok(())
//! # }
//! ```

use crate::record::{FileAttrs, Owner};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// File name prefix of every temporary artifact Retrace creates
pub const TEMP_PREFIX: &str = ".retrace-tmp.";

/// Which optional attributes are read and applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrOptions {
    /// Apply uid/gid (usually requires root)
    pub ownership: bool,
    /// Read and apply extended attributes
    pub xattrs: bool,
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Normalise `lstat` of `path` into typed attributes
///
/// Symlinks are never followed. A missing path yields [`FileAttrs::Missing`].
/// Fingerprints are left unset; hashing is the diff engine's decision.
#[cfg(unix)]
pub fn stat_attrs(path: &Path, with_xattrs: bool) -> io::Result<FileAttrs> {
    use crate::record::DeviceKind;
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileAttrs::Missing),
        Err(e) => return Err(e),
    };
    let file_type = meta.file_type();
    let perms = meta.mode() & 0o7777;
    let owner = Owner {
        uid: meta.uid(),
        gid: meta.gid(),
    };

    let attrs = if file_type.is_file() {
        FileAttrs::Regular {
            size: meta.len(),
            mtime: meta.mtime(),
            perms,
            owner,
            xattrs: if with_xattrs { read_xattrs(path)? } else { None },
            fingerprint: None,
        }
    } else if file_type.is_dir() {
        FileAttrs::Directory {
            mtime: meta.mtime(),
            perms,
            owner,
            xattrs: if with_xattrs { read_xattrs(path)? } else { None },
        }
    } else if file_type.is_symlink() {
        use std::os::unix::ffi::OsStrExt;
        let target = fs::read_link(path)?;
        FileAttrs::Symlink {
            target: target.as_os_str().as_bytes().to_vec(),
            owner,
        }
    } else if file_type.is_fifo() {
        FileAttrs::Fifo { perms, owner }
    } else if file_type.is_socket() {
        FileAttrs::Socket { perms, owner }
    } else {
        let kind = if file_type.is_block_device() {
            DeviceKind::Block
        } else {
            DeviceKind::Char
        };
        let (major, minor) = split_dev(meta.rdev());
        FileAttrs::Device {
            kind,
            major,
            minor,
            perms,
            owner,
        }
    };
    trace!("stat {:?}: {:?}", path, attrs.file_type());
    Ok(attrs)
}

/// Normalise metadata of `path` into typed attributes (non-unix fallback)
#[cfg(not(unix))]
pub fn stat_attrs(path: &Path, _with_xattrs: bool) -> io::Result<FileAttrs> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileAttrs::Missing),
        Err(e) => return Err(e),
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let perms = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    let file_type = meta.file_type();
    Ok(if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        FileAttrs::Symlink {
            target: target.to_string_lossy().into_owned().into_bytes(),
            owner: Owner::default(),
        }
    } else if file_type.is_dir() {
        FileAttrs::Directory {
            mtime,
            perms: perms | 0o111,
            owner: Owner::default(),
            xattrs: None,
        }
    } else {
        FileAttrs::Regular {
            size: meta.len(),
            mtime,
            perms,
            owner: Owner::default(),
            xattrs: None,
            fingerprint: None,
        }
    })
}

#[cfg(target_os = "linux")]
fn split_dev(dev: u64) -> (u64, u64) {
    (nix::sys::stat::major(dev), nix::sys::stat::minor(dev))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn split_dev(dev: u64) -> (u64, u64) {
    ((dev >> 24) & 0xff, dev & 0xff_ffff)
}

/// Read every extended attribute of `path` into one sorted, encoded blob
///
/// Returns `None` when the file carries no extended attributes or the
/// filesystem does not support them.
#[cfg(unix)]
pub fn read_xattrs(path: &Path) -> io::Result<Option<Vec<u8>>> {
    use std::os::unix::ffi::OsStrExt;

    if !xattr::SUPPORTED_PLATFORM {
        return Ok(None);
    }
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::Unsupported => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for name in names {
        if let Some(value) = xattr::get(path, &name)? {
            pairs.push((name.as_bytes().to_vec(), value));
        }
    }
    if pairs.is_empty() {
        return Ok(None);
    }
    pairs.sort();
    bincode::serde::encode_to_vec(&pairs, bincode::config::standard())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(unix)]
fn apply_xattrs(path: &Path, blob: Option<&[u8]>) -> io::Result<()> {
    let wanted: Vec<(Vec<u8>, Vec<u8>)> = match blob {
        Some(bytes) => {
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map(|(pairs, _)| pairs)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        }
        None => Vec::new(),
    };
    for existing in xattr::list(path)? {
        use std::os::unix::ffi::OsStrExt;
        let name = existing.as_bytes();
        if !wanted.iter().any(|(n, _)| n.as_slice() == name) {
            xattr::remove(path, &existing)?;
        }
    }
    for (name, value) in &wanted {
        xattr::set(path, crate::record::bytes_to_os(name), value)?;
    }
    Ok(())
}

/// Apply the attributes of `attrs` to the object at `path`
///
/// Order matters: extended attributes first, then ownership (which may clear
/// setuid bits), then permissions, then modification time last. Symlinks only
/// receive ownership.
pub fn apply_attrs(path: &Path, attrs: &FileAttrs, options: AttrOptions) -> io::Result<()> {
    #[cfg(unix)]
    {
        if options.xattrs && matches!(attrs, FileAttrs::Regular { .. } | FileAttrs::Directory { .. }) {
            apply_xattrs(path, attrs.xattrs())?;
        }
        if options.ownership {
            if let Some(owner) = attrs.owner() {
                std::os::unix::fs::lchown(path, Some(owner.uid), Some(owner.gid))?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = options;

    if let Some(perms) = attrs.perms() {
        set_mode(path, perms)?;
    }
    if let Some(mtime) = attrs.mtime() {
        filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime, 0))?;
    }
    Ok(())
}

/// Set permission bits
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Set permission bits (only the read-only flag survives off unix)
#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

/// Write `content` to `path`, replacing it, and fsync the file if `sync`
pub fn write_durable(path: &Path, content: &[u8], sync: bool) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(content)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

/// Fsync a directory so that renames inside it are durable
#[cfg(unix)]
pub fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Directory fsync is not available off unix
#[cfg(not(unix))]
pub fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Atomic file write (temp file, fsync, rename, fsync parent)
///
/// The target is never observable in a partially written state.
pub fn atomic_write(path: &Path, content: &[u8], sync: bool) -> io::Result<()> {
    let temp_path = temp_sibling(path);
    if let Err(e) = write_durable(&temp_path, content, sync) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    if sync {
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
    }
    Ok(())
}

/// A fresh temporary name next to `target` (same directory, same filesystem)
pub fn temp_sibling(target: &Path) -> PathBuf {
    let name = format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Whether a file name is one of our temporary artifacts
pub fn is_temp_name(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with(TEMP_PREFIX)
}

/// Create a symlink pointing at raw `target` bytes
#[cfg(unix)]
pub fn create_symlink(target: &[u8], link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(crate::record::bytes_to_os(target), link)
}

/// Symlinks are not supported by this build
#[cfg(not(unix))]
pub fn create_symlink(_target: &[u8], link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot create symlink {:?} on this platform", link),
    ))
}

/// Create a named pipe or device node described by `attrs`
///
/// Sockets cannot be recreated; they are reported as unsupported.
#[cfg(unix)]
pub fn make_special(path: &Path, attrs: &FileAttrs) -> io::Result<()> {
    use nix::sys::stat::Mode;

    match attrs {
        FileAttrs::Fifo { perms, .. } => {
            let mode = Mode::from_bits_truncate(*perms as nix::libc::mode_t);
            nix::unistd::mkfifo(path, mode).map_err(io::Error::from)
        }
        #[cfg(target_os = "linux")]
        FileAttrs::Device {
            kind,
            major,
            minor,
            perms,
            ..
        } => {
            use crate::record::DeviceKind;
            use nix::sys::stat::{makedev, mknod, SFlag};
            let flag = match kind {
                DeviceKind::Char => SFlag::S_IFCHR,
                DeviceKind::Block => SFlag::S_IFBLK,
            };
            let mode = Mode::from_bits_truncate(*perms as nix::libc::mode_t);
            mknod(path, flag, mode, makedev(*major, *minor)).map_err(io::Error::from)
        }
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot create {:?} at {:?}", other.file_type(), path),
        )),
    }
}

/// Special files are not supported by this build
#[cfg(not(unix))]
pub fn make_special(path: &Path, attrs: &FileAttrs) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot create {:?} at {:?}", attrs.file_type(), path),
    ))
}

/// Format bytes in human-readable form
///
/// Uses binary (1024-based) units.
///
/// ```rust
/// use retrace::fsutil::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
