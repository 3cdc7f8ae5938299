//! Call transport and access policy
//!
//! Every filesystem operation on the source or mirror side goes through a
//! [`Transport`]: a synchronous request/response channel carrying an
//! enumerated [`Request`]. [`LocalTransport`] executes requests against the
//! local filesystem; a remote implementation only has to move the same
//! serde-serializable messages over a wire.
//!
//! An [`AccessPolicy`] decides which operations a side may perform.
//! [`GuardedTransport`] checks the policy before forwarding and turns a denial
//! into [`RetraceError::SecurityViolation`], which aborts the run.
//!
//! ```rust
//! use retrace::transport::{GuardedTransport, LocalTransport, RestrictedPolicy, Transport};
//! use std::sync::Arc;
//!
//! let source = GuardedTransport::new(
//!     LocalTransport::new(),
//!     Arc::new(RestrictedPolicy::read_only("/home/me")),
//! );
//! assert!(source.remove("/home/me/file".as_ref()).is_err());
//! ```

use crate::error::{Result, RetraceError};
use crate::fsutil::{self, AttrOptions};
use crate::record::FileAttrs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{trace, warn};

/// Kind of a filesystem operation, as seen by an [`AccessPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsOp {
    /// lstat
    Stat,
    /// Read a whole file
    Read,
    /// List a directory
    List,
    /// Create or replace a file
    Write,
    /// Rename within one filesystem
    Rename,
    /// Create a directory
    Mkdir,
    /// Remove a non-directory
    Remove,
    /// Remove an empty directory
    RemoveDir,
    /// Apply attributes
    SetAttrs,
    /// Create a symlink
    Symlink,
    /// Create a fifo or device node
    MakeSpecial,
    /// Change permission bits
    SetMode,
}

impl FsOp {
    /// Whether the operation changes the filesystem
    pub fn is_mutation(&self) -> bool {
        !matches!(self, FsOp::Stat | FsOp::Read | FsOp::List)
    }
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One transport call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// lstat `path`, reading extended attributes if asked
    Stat { path: PathBuf, xattrs: bool },
    /// Read all of `path`
    Read { path: PathBuf },
    /// Names of the entries in directory `path`
    List { path: PathBuf },
    /// Create or replace `path` with `data`, fsyncing if `sync`
    Write { path: PathBuf, data: Vec<u8>, sync: bool },
    /// Rename `from` to `to`
    Rename { from: PathBuf, to: PathBuf },
    /// Create directory `path` (an existing directory is fine)
    Mkdir { path: PathBuf },
    /// Remove the non-directory at `path` (a missing path is fine)
    Remove { path: PathBuf },
    /// Remove the empty directory at `path`
    RemoveDir { path: PathBuf },
    /// Apply `attrs` to `path`
    SetAttrs {
        path: PathBuf,
        attrs: FileAttrs,
        options: AttrOptions,
    },
    /// Create a symlink at `path` pointing to `target`
    Symlink { target: Vec<u8>, path: PathBuf },
    /// Create the fifo or device node described by `attrs`
    MakeSpecial { path: PathBuf, attrs: FileAttrs },
    /// Set permission bits of `path`
    SetMode { path: PathBuf, mode: u32 },
}

impl Request {
    /// Operation kind
    pub fn op(&self) -> FsOp {
        match self {
            Request::Stat { .. } => FsOp::Stat,
            Request::Read { .. } => FsOp::Read,
            Request::List { .. } => FsOp::List,
            Request::Write { .. } => FsOp::Write,
            Request::Rename { .. } => FsOp::Rename,
            Request::Mkdir { .. } => FsOp::Mkdir,
            Request::Remove { .. } => FsOp::Remove,
            Request::RemoveDir { .. } => FsOp::RemoveDir,
            Request::SetAttrs { .. } => FsOp::SetAttrs,
            Request::Symlink { .. } => FsOp::Symlink,
            Request::MakeSpecial { .. } => FsOp::MakeSpecial,
            Request::SetMode { .. } => FsOp::SetMode,
        }
    }

    /// Every path the request touches
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Request::Rename { from, to } => vec![from, to],
            Request::Stat { path, .. }
            | Request::Read { path }
            | Request::List { path }
            | Request::Write { path, .. }
            | Request::Mkdir { path }
            | Request::Remove { path }
            | Request::RemoveDir { path }
            | Request::SetAttrs { path, .. }
            | Request::Symlink { path, .. }
            | Request::MakeSpecial { path, .. }
            | Request::SetMode { path, .. } => vec![path],
        }
    }

    /// Wire encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::serde::decode_from_slice(bytes, bincode::config::standard())?.0)
    }
}

/// Reply to a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Reply to `Stat`
    Attrs(FileAttrs),
    /// Reply to `Read`
    Data(Vec<u8>),
    /// Reply to `List`
    Names(Vec<Vec<u8>>),
    /// Reply to every mutation
    Done,
}

impl Response {
    /// Wire encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::serde::decode_from_slice(bytes, bincode::config::standard())?.0)
    }
}

fn unexpected(op: FsOp, response: Response) -> RetraceError {
    RetraceError::FatalConnection(format!("unexpected reply to {}: {:?}", op, response))
}

/// Synchronous request/response channel to one side of a session
///
/// Implementors provide [`Transport::call`]; the typed helpers are built on it.
pub trait Transport: Send + Sync {
    /// Execute one request
    fn call(&self, request: Request) -> Result<Response>;

    /// lstat a path
    fn stat(&self, path: &Path, xattrs: bool) -> Result<FileAttrs> {
        match self.call(Request::Stat {
            path: path.to_path_buf(),
            xattrs,
        })? {
            Response::Attrs(attrs) => Ok(attrs),
            other => Err(unexpected(FsOp::Stat, other)),
        }
    }

    /// Read a whole file
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match self.call(Request::Read {
            path: path.to_path_buf(),
        })? {
            Response::Data(data) => Ok(data),
            other => Err(unexpected(FsOp::Read, other)),
        }
    }

    /// List a directory
    fn list(&self, path: &Path) -> Result<Vec<Vec<u8>>> {
        match self.call(Request::List {
            path: path.to_path_buf(),
        })? {
            Response::Names(names) => Ok(names),
            other => Err(unexpected(FsOp::List, other)),
        }
    }

    /// Create or replace a file
    fn write(&self, path: &Path, data: Vec<u8>, sync: bool) -> Result<()> {
        self.expect_done(Request::Write {
            path: path.to_path_buf(),
            data,
            sync,
        })
    }

    /// Rename within one filesystem
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.expect_done(Request::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        })
    }

    /// Create a directory
    fn mkdir(&self, path: &Path) -> Result<()> {
        self.expect_done(Request::Mkdir {
            path: path.to_path_buf(),
        })
    }

    /// Remove a non-directory
    fn remove(&self, path: &Path) -> Result<()> {
        self.expect_done(Request::Remove {
            path: path.to_path_buf(),
        })
    }

    /// Remove an empty directory
    fn remove_dir(&self, path: &Path) -> Result<()> {
        self.expect_done(Request::RemoveDir {
            path: path.to_path_buf(),
        })
    }

    /// Apply attributes
    fn set_attrs(&self, path: &Path, attrs: &FileAttrs, options: AttrOptions) -> Result<()> {
        self.expect_done(Request::SetAttrs {
            path: path.to_path_buf(),
            attrs: attrs.clone(),
            options,
        })
    }

    /// Create a symlink
    fn symlink(&self, target: &[u8], path: &Path) -> Result<()> {
        self.expect_done(Request::Symlink {
            target: target.to_vec(),
            path: path.to_path_buf(),
        })
    }

    /// Create a fifo or device node
    fn make_special(&self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        self.expect_done(Request::MakeSpecial {
            path: path.to_path_buf(),
            attrs: attrs.clone(),
        })
    }

    /// Change permission bits
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        self.expect_done(Request::SetMode {
            path: path.to_path_buf(),
            mode,
        })
    }

    #[doc(hidden)]
    fn expect_done(&self, request: Request) -> Result<()> {
        let op = request.op();
        match self.call(request)? {
            Response::Done => Ok(()),
            other => Err(unexpected(op, other)),
        }
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn call(&self, request: Request) -> Result<Response> {
        (**self).call(request)
    }
}

/// Executes requests against the local filesystem
///
/// I/O failures map to [`RetraceError::TransientIo`] or
/// [`RetraceError::PermissionDenied`] carrying the failing path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl LocalTransport {
    /// Create a local transport
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RetraceError + '_ {
    move |e| RetraceError::transient(path, e)
}

impl Transport for LocalTransport {
    fn call(&self, request: Request) -> Result<Response> {
        trace!("local {} {:?}", request.op(), request.paths());
        match request {
            Request::Stat { path, xattrs } => fsutil::stat_attrs(&path, xattrs)
                .map(Response::Attrs)
                .map_err(io_err(&path)),
            Request::Read { path } => fs::read(&path).map(Response::Data).map_err(io_err(&path)),
            Request::List { path } => {
                let mut names = Vec::new();
                for entry in fs::read_dir(&path).map_err(io_err(&path))? {
                    let entry = entry.map_err(io_err(&path))?;
                    names.push(name_bytes(&entry.file_name()));
                }
                Ok(Response::Names(names))
            }
            Request::Write { path, data, sync } => fsutil::write_durable(&path, &data, sync)
                .map(|_| Response::Done)
                .map_err(io_err(&path)),
            Request::Rename { from, to } => {
                fs::rename(&from, &to).map_err(io_err(&to))?;
                if let Some(parent) = to.parent() {
                    fsutil::sync_dir(parent).map_err(io_err(parent))?;
                }
                Ok(Response::Done)
            }
            Request::Mkdir { path } => match fs::create_dir(&path) {
                Ok(()) => Ok(Response::Done),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => {
                    Ok(Response::Done)
                }
                Err(e) => Err(RetraceError::transient(&path, e)),
            },
            Request::Remove { path } => match fs::remove_file(&path) {
                Ok(()) => Ok(Response::Done),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Response::Done),
                Err(e) => Err(RetraceError::transient(&path, e)),
            },
            Request::RemoveDir { path } => fs::remove_dir(&path)
                .map(|_| Response::Done)
                .map_err(io_err(&path)),
            Request::SetAttrs {
                path,
                attrs,
                options,
            } => fsutil::apply_attrs(&path, &attrs, options)
                .map(|_| Response::Done)
                .map_err(io_err(&path)),
            Request::Symlink { target, path } => fsutil::create_symlink(&target, &path)
                .map(|_| Response::Done)
                .map_err(io_err(&path)),
            Request::MakeSpecial { path, attrs } => match fsutil::make_special(&path, &attrs) {
                Ok(()) => Ok(Response::Done),
                Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                    Err(RetraceError::UnsupportedFileType { path })
                }
                Err(e) => Err(RetraceError::transient(&path, e)),
            },
            Request::SetMode { path, mode } => fsutil::set_mode(&path, mode)
                .map(|_| Response::Done)
                .map_err(io_err(&path)),
        }
    }
}

/// Decides whether a side may perform an operation on a path
pub trait AccessPolicy: Send + Sync + fmt::Debug {
    /// `Ok(())` to allow, [`RetraceError::SecurityViolation`] to deny
    fn check(&self, op: FsOp, path: &Path) -> Result<()>;
}

/// Allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _op: FsOp, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Allows operations inside one subtree only, optionally read only
#[derive(Debug, Clone)]
pub struct RestrictedPolicy {
    root: PathBuf,
    read_only: bool,
}

impl RestrictedPolicy {
    /// Allow reads and writes below `root`
    pub fn read_write(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
        }
    }

    /// Allow reads below `root`
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: true,
        }
    }
}

/// Whether `path` stays lexically inside `root` (no `..` escapes)
fn is_within(root: &Path, path: &Path) -> bool {
    let Ok(rest) = path.strip_prefix(root) else {
        return false;
    };
    rest.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl AccessPolicy for RestrictedPolicy {
    fn check(&self, op: FsOp, path: &Path) -> Result<()> {
        let denied = || RetraceError::SecurityViolation {
            op: op.to_string(),
            path: path.to_path_buf(),
        };
        if self.read_only && op.is_mutation() {
            return Err(denied());
        }
        if !is_within(&self.root, path) {
            return Err(denied());
        }
        Ok(())
    }
}

/// Enforces an [`AccessPolicy`] in front of another transport
#[derive(Debug, Clone)]
pub struct GuardedTransport<T> {
    inner: T,
    policy: Arc<dyn AccessPolicy>,
}

impl<T: Transport> GuardedTransport<T> {
    /// Guard `inner` with `policy`
    pub fn new(inner: T, policy: Arc<dyn AccessPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl<T: Transport> Transport for GuardedTransport<T> {
    fn call(&self, request: Request) -> Result<Response> {
        let op = request.op();
        for path in request.paths() {
            if let Err(e) = self.policy.check(op, path) {
                warn!("Refused {} on {:?}", op, path);
                return Err(e);
            }
        }
        self.inner.call(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use tempfile::TempDir;

    #[test]
    fn test_local_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let transport = LocalTransport::new();
        let file = temp_dir.path().join("f");

        transport.write(&file, b"payload".to_vec(), true).unwrap();
        assert_eq!(transport.read(&file).unwrap(), b"payload");
        assert_eq!(transport.stat(&file, false).unwrap().size(), 7);

        let moved = temp_dir.path().join("g");
        transport.rename(&file, &moved).unwrap();
        assert!(!transport.stat(&file, false).unwrap().exists());

        let dir = temp_dir.path().join("d");
        transport.mkdir(&dir).unwrap();
        transport.mkdir(&dir).unwrap();
        let mut names = transport.list(temp_dir.path()).unwrap();
        names.sort();
        assert_eq!(names, vec![b"d".to_vec(), b"g".to_vec()]);

        transport.remove(&moved).unwrap();
        transport.remove(&moved).unwrap();
        transport.remove_dir(&dir).unwrap();
        assert!(transport.list(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_read_missing_is_transient() {
        let temp_dir = TempDir::new().unwrap();
        let err = LocalTransport::new()
            .read(&temp_dir.path().join("nope"))
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientIo);
    }

    #[test]
    fn test_restricted_policy() {
        let policy = RestrictedPolicy::read_only("/srv/data");
        assert!(policy.check(FsOp::Read, Path::new("/srv/data/a/b")).is_ok());
        assert!(policy.check(FsOp::Write, Path::new("/srv/data/a")).is_err());
        assert!(policy.check(FsOp::Read, Path::new("/srv/other")).is_err());
        assert!(policy
            .check(FsOp::Read, Path::new("/srv/data/../secret"))
            .is_err());

        let rw = RestrictedPolicy::read_write("/srv/data");
        assert!(rw.check(FsOp::Rename, Path::new("/srv/data/x")).is_ok());
    }

    #[test]
    fn test_guarded_transport_denies_with_security_violation() {
        let temp_dir = TempDir::new().unwrap();
        let inside = temp_dir.path().join("inside");
        std::fs::create_dir(&inside).unwrap();
        let guarded = GuardedTransport::new(
            LocalTransport::new(),
            Arc::new(RestrictedPolicy::read_write(&inside)),
        );
        guarded.write(&inside.join("ok"), b"1".to_vec(), false).unwrap();

        let err = guarded
            .rename(&inside.join("ok"), &temp_dir.path().join("escaped"))
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::SecurityViolation);
        assert!(err.is_fatal());
        assert!(inside.join("ok").exists());
    }

    #[test]
    fn test_messages_encode() {
        let request = Request::Write {
            path: PathBuf::from("/m/x"),
            data: b"hello".to_vec(),
            sync: true,
        };
        let bytes = request.to_bytes().unwrap();
        assert_eq!(Request::from_bytes(&bytes).unwrap(), request);

        let response = Response::Names(vec![b"a".to_vec()]);
        assert_eq!(Response::from_bytes(&response.to_bytes().unwrap()).unwrap(), response);
    }
}
