//! Paired tree walker
//!
//! [`PairedWalker`] merges a depth-first, pre-order walk of the source tree
//! with one of the mirror tree. Children are visited in byte-wise order of
//! their names, so the yielded indexes strictly increase. A path that exists
//! on one side only is paired with `None` on the other.
//!
//! Selection rules filter the source side only: an excluded source entry is
//! treated as absent, so a mirror copy of it shows up as deleted.
//!
//! A directory that cannot be listed is still yielded, with
//! [`PairedEntry::listing_error`] set, and the walk does not descend into it.
//!
//! The mirror's data directory (`retrace-data` at the mirror root) is never
//! yielded, and a same-named entry at the source root is ignored.
//!
//! ## Relaxed permissions
//!
//! When `relax_permissions` is set and a directory cannot be listed, the
//! walker adds owner `rwx` to it, lists it, and restores the original mode
//! once the directory's last child has been yielded. Dropping the walker
//! early would leave such directories relaxed, so stopping early goes through
//! [`PairedWalker::abandon`], which reports them.
//!
//! ```rust,no_run
//! use retrace::walker::{PairedWalker, WalkOptions};
//! use retrace::selection::Selector;
//!
//! # fn main() -> retrace::Result<()> {
//! let walker = PairedWalker::local("/home/me", "/backups/me", Selector::all(), WalkOptions::default());
//! for entry in walker {
//!     let entry = entry?;
//!     println!("{} src={} mirror={}", entry.index, entry.source.is_some(), entry.mirror.is_some());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{ErrorClass, Result, RetraceError};
use crate::record::{FileRecord, Index};
use crate::selection::Selector;
use crate::transport::{LocalTransport, Transport};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Name of the backup-data directory at the mirror root
pub const DATA_DIR_NAME: &str = "retrace-data";

/// One step of the merged walk
#[derive(Debug, Clone)]
pub struct PairedEntry {
    /// Position in both trees
    pub index: Index,
    /// Source record, `None` if absent or deselected
    pub source: Option<FileRecord>,
    /// Mirror record, `None` if absent
    pub mirror: Option<FileRecord>,
    /// Why the children of this directory were not walked
    pub listing_error: Option<Arc<RetraceError>>,
}

impl PairedEntry {
    /// Whether either side is a directory
    pub fn has_dir(&self) -> bool {
        self.source.as_ref().is_some_and(|r| r.attrs.is_dir())
            || self.mirror.as_ref().is_some_and(|r| r.attrs.is_dir())
    }
}

/// Walker settings
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// Relax unreadable directories' permissions while listing them
    pub relax_permissions: bool,
    /// Read extended attributes while stat-ing
    pub xattrs: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            relax_permissions: true,
            xattrs: false,
        }
    }
}

/// Which tree a path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The tree being backed up
    Source,
    /// The mirror
    Mirror,
}

/// A directory whose permissions were relaxed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaxedDir {
    /// Tree it belongs to
    pub side: Side,
    /// Absolute path
    pub path: PathBuf,
    /// Permission bits to put back
    pub original_mode: u32,
}

#[derive(Debug)]
struct Frame {
    index: Index,
    source: Vec<Vec<u8>>,
    mirror: Vec<Vec<u8>>,
    next_source: usize,
    next_mirror: usize,
    relaxed: Vec<RelaxedDir>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    Start,
    Walking,
    Finished,
    Abandoned,
}

/// Explicit state machine over the merged source/mirror walk
pub struct PairedWalker {
    source: Arc<dyn Transport>,
    source_root: PathBuf,
    mirror: Arc<dyn Transport>,
    mirror_root: PathBuf,
    selector: Selector,
    options: WalkOptions,
    state: WalkState,
    stack: Vec<Frame>,
}

impl std::fmt::Debug for PairedWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedWalker")
            .field("source_root", &self.source_root)
            .field("mirror_root", &self.mirror_root)
            .field("state", &self.state)
            .field("depth", &self.stack.len())
            .finish()
    }
}

impl PairedWalker {
    /// Walk `source_root` and `mirror_root` through the given transports
    pub fn new(
        source: Arc<dyn Transport>,
        source_root: impl Into<PathBuf>,
        mirror: Arc<dyn Transport>,
        mirror_root: impl Into<PathBuf>,
        selector: Selector,
        options: WalkOptions,
    ) -> Self {
        Self {
            source,
            source_root: source_root.into(),
            mirror,
            mirror_root: mirror_root.into(),
            selector,
            options,
            state: WalkState::Start,
            stack: Vec::new(),
        }
    }

    /// Walk two local trees
    pub fn local(
        source_root: impl Into<PathBuf>,
        mirror_root: impl Into<PathBuf>,
        selector: Selector,
        options: WalkOptions,
    ) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
        Self::new(
            transport.clone(),
            source_root,
            transport,
            mirror_root,
            selector,
            options,
        )
    }

    /// Stop before exhaustion
    ///
    /// Directories relaxed for listing are left as they are and returned so
    /// the caller can report or repair them.
    pub fn abandon(mut self) -> Vec<RelaxedDir> {
        self.state = WalkState::Abandoned;
        let relaxed: Vec<RelaxedDir> = self
            .stack
            .drain(..)
            .flat_map(|frame| frame.relaxed)
            .collect();
        for dir in &relaxed {
            warn!(
                "Walk abandoned; {:?} left with relaxed mode (original {:o})",
                dir.path, dir.original_mode
            );
        }
        relaxed
    }

    fn transport(&self, side: Side) -> (&dyn Transport, &Path) {
        match side {
            Side::Source => (self.source.as_ref(), &self.source_root),
            Side::Mirror => (self.mirror.as_ref(), &self.mirror_root),
        }
    }

    fn stat_side(&self, side: Side, index: &Index) -> Result<Option<FileRecord>> {
        let (transport, root) = self.transport(side);
        let attrs = transport.stat(&index.to_path(root), self.options.xattrs)?;
        Ok(attrs
            .exists()
            .then(|| FileRecord::new(index.clone(), attrs)))
    }

    fn list_side(&self, side: Side, index: &Index, relaxed: &mut Vec<RelaxedDir>) -> Result<Vec<Vec<u8>>> {
        let (transport, root) = self.transport(side);
        let path = index.to_path(root);
        match transport.list(&path) {
            Ok(names) => Ok(names),
            Err(e) if e.class() == ErrorClass::PermissionDenied && self.options.relax_permissions => {
                let original_mode = transport.stat(&path, false)?.perms().unwrap_or(0o755);
                transport.set_mode(&path, original_mode | 0o700)?;
                debug!("Relaxed {:?} from {:o} to list it", path, original_mode);
                relaxed.push(RelaxedDir {
                    side,
                    path: path.clone(),
                    original_mode,
                });
                transport.list(&path)
            }
            Err(e) => Err(e),
        }
    }

    fn restore_relaxed(&self, relaxed: &[RelaxedDir]) {
        for dir in relaxed.iter().rev() {
            let (transport, _) = self.transport(dir.side);
            match transport.set_mode(&dir.path, dir.original_mode) {
                Ok(()) => trace!("Restored mode {:o} on {:?}", dir.original_mode, dir.path),
                Err(e) => warn!("Could not restore mode on {:?}: {}", dir.path, e),
            }
        }
    }

    fn push_frame(&mut self, entry: &PairedEntry) -> Result<()> {
        let mut relaxed = Vec::new();
        let listed = self.list_children(entry, &mut relaxed);
        match listed {
            Ok((source, mirror)) => {
                self.stack.push(Frame {
                    index: entry.index.clone(),
                    source,
                    mirror,
                    next_source: 0,
                    next_mirror: 0,
                    relaxed,
                });
                Ok(())
            }
            Err(e) => {
                self.restore_relaxed(&relaxed);
                Err(e)
            }
        }
    }

    fn list_children(
        &self,
        entry: &PairedEntry,
        relaxed: &mut Vec<RelaxedDir>,
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let mut source = match &entry.source {
            Some(record) if record.attrs.is_dir() => self.list_side(Side::Source, &entry.index, relaxed)?,
            _ => Vec::new(),
        };
        let mut mirror = match &entry.mirror {
            Some(record) if record.attrs.is_dir() => self.list_side(Side::Mirror, &entry.index, relaxed)?,
            _ => Vec::new(),
        };
        if entry.index.is_root() {
            source.retain(|name| name.as_slice() != DATA_DIR_NAME.as_bytes());
            mirror.retain(|name| name.as_slice() != DATA_DIR_NAME.as_bytes());
        }
        source.sort();
        mirror.sort();
        Ok((source, mirror))
    }

    fn start(&mut self) -> Result<PairedEntry> {
        let index = Index::root();
        let source = self.stat_side(Side::Source, &index)?;
        match &source {
            Some(record) if record.attrs.is_dir() => {}
            _ => {
                return Err(RetraceError::InvalidConfiguration(format!(
                    "source root {:?} is not a directory",
                    self.source_root
                )))
            }
        }
        let mirror = self.stat_side(Side::Mirror, &index)?;
        let entry = PairedEntry {
            index,
            source,
            mirror,
            listing_error: None,
        };
        self.push_frame(&entry)
            .map_err(|e| RetraceError::internal(format!("cannot list tree root: {}", e)))?;
        Ok(entry)
    }

    fn visit(&mut self, index: Index, in_source: bool, in_mirror: bool) -> Result<Option<PairedEntry>> {
        let source = if in_source {
            self.stat_side(Side::Source, &index)?
                .filter(|record| self.selector.is_selected(&index, record.attrs.is_dir()))
        } else {
            None
        };
        let mirror = if in_mirror {
            self.stat_side(Side::Mirror, &index)?
        } else {
            None
        };
        if source.is_none() && mirror.is_none() {
            return Ok(None);
        }
        let mut entry = PairedEntry {
            index,
            source,
            mirror,
            listing_error: None,
        };
        if entry.has_dir() {
            if let Err(e) = self.push_frame(&entry) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("Not descending into {}: {}", entry.index, e);
                entry.listing_error = Some(Arc::new(e));
            }
        }
        Ok(Some(entry))
    }
}

impl Iterator for PairedWalker {
    type Item = Result<PairedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                WalkState::Start => {
                    self.state = WalkState::Walking;
                    let started = self.start();
                    if started.is_err() {
                        self.state = WalkState::Finished;
                    }
                    return Some(started);
                }
                WalkState::Finished | WalkState::Abandoned => return None,
                WalkState::Walking => {}
            }

            let Some(frame) = self.stack.last_mut() else {
                self.state = WalkState::Finished;
                return None;
            };

            let next_source = frame.source.get(frame.next_source);
            let next_mirror = frame.mirror.get(frame.next_mirror);
            let (name, in_source, in_mirror) = match (next_source, next_mirror) {
                (None, None) => {
                    if let Some(done) = self.stack.pop() {
                        self.restore_relaxed(&done.relaxed);
                    }
                    continue;
                }
                (Some(s), None) => (s.clone(), true, false),
                (None, Some(m)) => (m.clone(), false, true),
                (Some(s), Some(m)) => match s.cmp(m) {
                    Ordering::Less => (s.clone(), true, false),
                    Ordering::Greater => (m.clone(), false, true),
                    Ordering::Equal => (s.clone(), true, true),
                },
            };
            if in_source {
                frame.next_source += 1;
            }
            if in_mirror {
                frame.next_mirror += 1;
            }
            let index = frame.index.child(&name);

            match self.visit(index, in_source, in_mirror) {
                Ok(Some(entry)) => {
                    trace!("walk {}", entry.index);
                    return Some(Ok(entry));
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::SelectionRule;
    use std::fs;
    use tempfile::TempDir;

    fn walk(source: &Path, mirror: &Path, selector: Selector) -> Vec<(String, bool, bool)> {
        PairedWalker::local(source, mirror, selector, WalkOptions::default())
            .map(|e| {
                let e = e.unwrap();
                (e.index.to_string(), e.source.is_some(), e.mirror.is_some())
            })
            .collect()
    }

    #[test]
    fn test_merged_order() {
        let src = TempDir::new().unwrap();
        let mir = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"1").unwrap();
        fs::create_dir(src.path().join("b")).unwrap();
        fs::write(src.path().join("b/c"), b"2").unwrap();
        fs::write(src.path().join("d"), b"3").unwrap();

        fs::write(mir.path().join("a"), b"1").unwrap();
        fs::create_dir(mir.path().join("b")).unwrap();
        fs::write(mir.path().join("b/c"), b"2").unwrap();
        fs::write(mir.path().join("e"), b"4").unwrap();
        fs::create_dir(mir.path().join(DATA_DIR_NAME)).unwrap();

        let entries = walk(src.path(), mir.path(), Selector::all());
        assert_eq!(
            entries,
            vec![
                (".".to_string(), true, true),
                ("a".to_string(), true, true),
                ("b".to_string(), true, true),
                ("b/c".to_string(), true, true),
                ("d".to_string(), true, false),
                ("e".to_string(), false, true),
            ]
        );
    }

    #[test]
    fn test_missing_mirror_root() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("x"), b"hello").unwrap();
        let mir = TempDir::new().unwrap();
        let entries = walk(src.path(), &mir.path().join("absent"), Selector::all());
        assert_eq!(
            entries,
            vec![(".".to_string(), true, false), ("x".to_string(), true, false)]
        );
    }

    #[test]
    fn test_excluded_source_entry_pairs_with_mirror() {
        let src = TempDir::new().unwrap();
        let mir = TempDir::new().unwrap();
        fs::write(src.path().join("keep"), b"1").unwrap();
        fs::write(src.path().join("skip.tmp"), b"1").unwrap();
        fs::write(mir.path().join("skip.tmp"), b"1").unwrap();

        let selector = Selector::new(&[SelectionRule::exclude("*.tmp")]).unwrap();
        let entries = walk(src.path(), mir.path(), selector);
        assert_eq!(
            entries,
            vec![
                (".".to_string(), true, true),
                ("keep".to_string(), true, false),
                ("skip.tmp".to_string(), false, true),
            ]
        );
    }

    #[test]
    fn test_source_root_must_be_directory() {
        let src = TempDir::new().unwrap();
        let file = src.path().join("file");
        fs::write(&file, b"x").unwrap();
        let mut walker = PairedWalker::local(&file, src.path(), Selector::all(), WalkOptions::default());
        assert!(walker.next().unwrap().is_err());
        assert!(walker.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_relaxed_directory_is_restored() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let mir = TempDir::new().unwrap();
        let locked = src.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("inner"), b"1").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // root bypasses permission checks, nothing to relax then
        let entries = walk(src.path(), mir.path(), Selector::all());
        let mode = fs::metadata(&locked).unwrap().permissions().mode() & 0o7777;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(mode, 0o000);
        assert!(entries.iter().any(|(name, _, _)| name == "locked/inner"));
    }

    #[cfg(unix)]
    #[test]
    fn test_abandon_reports_relaxed_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let mir = TempDir::new().unwrap();
        let locked = src.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("inner"), b"1").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let mut walker =
            PairedWalker::local(src.path(), mir.path(), Selector::all(), WalkOptions::default());
        walker.next().unwrap().unwrap(); // root
        let locked_entry = walker.next().unwrap().unwrap();
        assert_eq!(locked_entry.index.to_string(), "locked");
        let relaxed = walker.abandon();

        let is_root = fs::read_dir(&locked).is_ok()
            && relaxed.is_empty()
            && fs::metadata(&locked).unwrap().permissions().mode() & 0o7777 == 0;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        if !is_root {
            assert_eq!(relaxed.len(), 1);
            assert_eq!(relaxed[0].path, locked);
            assert_eq!(relaxed[0].original_mode, 0o000);
        }
    }

    /// Mirror-side transport whose listing of one directory is refused
    struct DenyList {
        inner: LocalTransport,
        denied: PathBuf,
    }

    impl Transport for DenyList {
        fn call(&self, request: crate::transport::Request) -> Result<crate::transport::Response> {
            match request {
                crate::transport::Request::List { path } if path == self.denied => {
                    Err(RetraceError::PermissionDenied { path })
                }
                other => self.inner.call(other),
            }
        }
    }

    #[test]
    fn test_unlistable_directory_is_yielded_without_children() {
        let src = TempDir::new().unwrap();
        let mir = TempDir::new().unwrap();
        for root in [src.path(), mir.path()] {
            fs::create_dir(root.join("locked")).unwrap();
            fs::write(root.join("locked/inner"), b"1").unwrap();
            fs::write(root.join("z"), b"2").unwrap();
        }
        let mirror: Arc<dyn Transport> = Arc::new(DenyList {
            inner: LocalTransport::new(),
            denied: mir.path().join("locked"),
        });
        let options = WalkOptions {
            relax_permissions: false,
            xattrs: false,
        };
        let walker = PairedWalker::new(
            Arc::new(LocalTransport::new()),
            src.path(),
            mirror,
            mir.path(),
            Selector::all(),
            options,
        );

        let entries: Vec<PairedEntry> = walker.map(|e| e.unwrap()).collect();
        let names: Vec<String> = entries.iter().map(|e| e.index.to_string()).collect();
        assert_eq!(names, vec![".", "locked", "z"]);
        let locked = &entries[1];
        assert!(locked.source.is_some() && locked.mirror.is_some());
        assert!(matches!(
            locked.listing_error.as_deref(),
            Some(RetraceError::PermissionDenied { .. })
        ));
        assert!(entries[2].listing_error.is_none());
    }
}
