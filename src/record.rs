//! File records: host-independent snapshots of one filesystem object
//!
//! A [`FileRecord`] pairs an [`Index`] (the object's position in a tree) with
//! a fixed-schema [`FileAttrs`] variant keyed by file type. Records are what
//! the walker yields, what the diff engine compares and what the metadata
//! log persists.
//!
//! ## Ordering
//!
//! Indexes order component by component with byte-wise comparison inside a
//! component. A directory therefore sorts immediately before its own
//! children, and a depth-first pre-order walk over byte-sorted directory
//! listings visits indexes in strictly increasing order. The walker, the
//! metadata log and the prior-record cursor all rely on this.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Position of an object in a tree, as a sequence of raw path components.
///
/// The empty index is the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Index(Vec<Vec<u8>>);

impl Index {
    /// The root index
    pub fn root() -> Self {
        Index(Vec::new())
    }

    /// Build an index from raw components
    pub fn from_components<I, C>(components: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Index(components.into_iter().map(Into::into).collect())
    }

    /// Build an index from a relative path such as `b/c`
    ///
    /// Empty, `.` and leading `/` components are dropped.
    pub fn from_relative(path: &Path) -> Self {
        use std::path::Component;
        Index(
            path.components()
                .filter_map(|c| match c {
                    Component::Normal(name) => Some(os_to_bytes(name)),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Whether this is the tree root
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw components
    pub fn components(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Number of components
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Last component, if any
    pub fn name(&self) -> Option<&[u8]> {
        self.0.last().map(Vec::as_slice)
    }

    /// Index of the parent directory (`None` for the root)
    pub fn parent(&self) -> Option<Index> {
        if self.0.is_empty() {
            None
        } else {
            Some(Index(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Index of a child entry
    pub fn child(&self, name: &[u8]) -> Index {
        let mut components = self.0.clone();
        components.push(name.to_vec());
        Index(components)
    }

    /// Whether `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &Index) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }

    /// Resolve this index below a root directory
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for component in &self.0 {
            path.push(bytes_to_os(component));
        }
        path
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, ".");
        }
        let parts: Vec<_> = self.0.iter().map(|c| String::from_utf8_lossy(c)).collect();
        write!(f, "{}", parts.join("/"))
    }
}

#[cfg(unix)]
fn os_to_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_to_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
pub(crate) fn bytes_to_os(bytes: &[u8]) -> std::ffi::OsString {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::OsStr::from_bytes(bytes).to_os_string()
}

#[cfg(not(unix))]
pub(crate) fn bytes_to_os(bytes: &[u8]) -> std::ffi::OsString {
    std::ffi::OsString::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Owner and group ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    /// Numeric user id
    pub uid: u32,
    /// Numeric group id
    pub gid: u32,
}

/// Character or block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Character device
    Char,
    /// Block device
    Block,
}

/// Attribute set of one filesystem object, keyed by its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAttrs {
    /// Regular file
    Regular {
        /// Content length in bytes
        size: u64,
        /// Modification time, seconds since the epoch
        mtime: i64,
        /// Permission bits (`mode & 0o7777`)
        perms: u32,
        /// Ownership
        owner: Owner,
        /// Encoded extended attributes
        xattrs: Option<Vec<u8>>,
        /// SHA-256 of the content, hex encoded
        fingerprint: Option<String>,
    },
    /// Directory
    Directory {
        /// Modification time, seconds since the epoch
        mtime: i64,
        /// Permission bits
        perms: u32,
        /// Ownership
        owner: Owner,
        /// Encoded extended attributes
        xattrs: Option<Vec<u8>>,
    },
    /// Symbolic link
    Symlink {
        /// Raw link target
        target: Vec<u8>,
        /// Ownership
        owner: Owner,
    },
    /// Named pipe
    Fifo {
        /// Permission bits
        perms: u32,
        /// Ownership
        owner: Owner,
    },
    /// Unix domain socket
    Socket {
        /// Permission bits
        perms: u32,
        /// Ownership
        owner: Owner,
    },
    /// Character or block device node
    Device {
        /// Device kind
        kind: DeviceKind,
        /// Major number
        major: u64,
        /// Minor number
        minor: u64,
        /// Permission bits
        perms: u32,
        /// Ownership
        owner: Owner,
    },
    /// Nothing exists at this index
    Missing,
}

/// Coarse file type, used for journal entries and increment decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Named pipe
    Fifo,
    /// Unix domain socket
    Socket,
    /// Device node
    Device,
    /// Absent
    Missing,
}

impl FileType {
    /// Short tag used in the metadata log
    pub fn tag(&self) -> &'static str {
        match self {
            FileType::Regular => "reg",
            FileType::Directory => "dir",
            FileType::Symlink => "sym",
            FileType::Fifo => "fifo",
            FileType::Socket => "sock",
            FileType::Device => "dev",
            FileType::Missing => "missing",
        }
    }
}

impl FileAttrs {
    /// Coarse type of these attributes
    pub fn file_type(&self) -> FileType {
        match self {
            FileAttrs::Regular { .. } => FileType::Regular,
            FileAttrs::Directory { .. } => FileType::Directory,
            FileAttrs::Symlink { .. } => FileType::Symlink,
            FileAttrs::Fifo { .. } => FileType::Fifo,
            FileAttrs::Socket { .. } => FileType::Socket,
            FileAttrs::Device { .. } => FileType::Device,
            FileAttrs::Missing => FileType::Missing,
        }
    }

    /// Whether this is a directory
    pub fn is_dir(&self) -> bool {
        matches!(self, FileAttrs::Directory { .. })
    }

    /// Whether this is a regular file
    pub fn is_regular(&self) -> bool {
        matches!(self, FileAttrs::Regular { .. })
    }

    /// Whether something exists
    pub fn exists(&self) -> bool {
        !matches!(self, FileAttrs::Missing)
    }

    /// Content length for regular files, zero otherwise
    pub fn size(&self) -> u64 {
        match self {
            FileAttrs::Regular { size, .. } => *size,
            _ => 0,
        }
    }

    /// Modification time where tracked
    pub fn mtime(&self) -> Option<i64> {
        match self {
            FileAttrs::Regular { mtime, .. } | FileAttrs::Directory { mtime, .. } => Some(*mtime),
            _ => None,
        }
    }

    /// Permission bits where tracked
    pub fn perms(&self) -> Option<u32> {
        match self {
            FileAttrs::Regular { perms, .. }
            | FileAttrs::Directory { perms, .. }
            | FileAttrs::Fifo { perms, .. }
            | FileAttrs::Socket { perms, .. }
            | FileAttrs::Device { perms, .. } => Some(*perms),
            FileAttrs::Symlink { .. } | FileAttrs::Missing => None,
        }
    }

    /// Ownership where tracked
    pub fn owner(&self) -> Option<Owner> {
        match self {
            FileAttrs::Regular { owner, .. }
            | FileAttrs::Directory { owner, .. }
            | FileAttrs::Symlink { owner, .. }
            | FileAttrs::Fifo { owner, .. }
            | FileAttrs::Socket { owner, .. }
            | FileAttrs::Device { owner, .. } => Some(*owner),
            FileAttrs::Missing => None,
        }
    }

    /// Encoded extended attributes where tracked
    pub fn xattrs(&self) -> Option<&[u8]> {
        match self {
            FileAttrs::Regular { xattrs, .. } | FileAttrs::Directory { xattrs, .. } => {
                xattrs.as_deref()
            }
            _ => None,
        }
    }

    /// Content fingerprint for regular files
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            FileAttrs::Regular { fingerprint, .. } => fingerprint.as_deref(),
            _ => None,
        }
    }

    /// Replace the fingerprint of a regular file
    pub fn with_fingerprint(mut self, hash: String) -> Self {
        if let FileAttrs::Regular { fingerprint, .. } = &mut self {
            *fingerprint = Some(hash);
        }
        self
    }

    /// Compare every attribute except content (size, fingerprint, link target)
    ///
    /// Attributes of different types never compare equal.
    pub fn same_metadata(&self, other: &FileAttrs) -> bool {
        if self.file_type() != other.file_type() {
            return false;
        }
        self.perms() == other.perms()
            && self.owner() == other.owner()
            && self.mtime() == other.mtime()
            && self.xattrs() == other.xattrs()
    }
}

/// One filesystem object's metadata, independent of host
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Position in the tree
    pub index: Index,
    /// Typed attributes
    pub attrs: FileAttrs,
}

impl FileRecord {
    /// Create a record
    pub fn new(index: Index, attrs: FileAttrs) -> Self {
        Self { index, attrs }
    }

    /// Record for an absent object
    pub fn missing(index: Index) -> Self {
        Self {
            index,
            attrs: FileAttrs::Missing,
        }
    }

    /// Coarse file type
    pub fn file_type(&self) -> FileType {
        self.attrs.file_type()
    }
}

/// Records are equal when all attributes relevant to their common type match.
///
/// Fingerprints only participate when both records carry one, since a record
/// read back from the live filesystem has not been hashed.
impl PartialEq for FileRecord {
    fn eq(&self, other: &Self) -> bool {
        if self.index != other.index {
            return false;
        }
        match (&self.attrs, &other.attrs) {
            (
                FileAttrs::Regular { size: s1, fingerprint: f1, .. },
                FileAttrs::Regular { size: s2, fingerprint: f2, .. },
            ) => {
                let content_matches = match (f1, f2) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                };
                s1 == s2 && content_matches && self.attrs.same_metadata(&other.attrs)
            }
            (
                FileAttrs::Symlink { target: t1, owner: o1 },
                FileAttrs::Symlink { target: t2, owner: o2 },
            ) => t1 == t2 && o1 == o2,
            (
                FileAttrs::Device { kind: k1, major: ma1, minor: mi1, .. },
                FileAttrs::Device { kind: k2, major: ma2, minor: mi2, .. },
            ) => k1 == k2 && ma1 == ma2 && mi1 == mi2 && self.attrs.same_metadata(&other.attrs),
            (a, b) => a.same_metadata(b),
        }
    }
}
