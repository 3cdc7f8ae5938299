//! Increment naming and storage
//!
//! An increment is the reverse information needed to turn a mirror entry
//! back into what it was when an earlier session finalized. It lives at
//!
//! ```text
//! retrace-data/increments/<parent dirs>/<name>.<superseded session>.<action>
//! ```
//!
//! where `<action>` is one of:
//!
//! | Tag | Meaning | Content |
//! |---|---|---|
//! | `diff` | file changed | bincode reverse delta against the newer content |
//! | `snapshot` | file changed type, was deleted, or a delta did not pay off | full old content (symlink target for symlinks) |
//! | `missing` | nothing existed at this path | empty |
//! | `dir` | a directory existed here | empty |
//!
//! Session ids contain no `.`, so a name is parsed from the right and base
//! names may contain dots. Committing over an existing increment fails with
//! [`RetraceError::IncrementExists`]; an entry has at most one increment per
//! session, and the writer replaces one explicitly through the journal.

use crate::error::{Result, RetraceError};
use crate::fsutil;
use crate::record::Index;
use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// What an increment records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncrementAction {
    /// Reverse delta
    Diff,
    /// Nothing existed
    Missing,
    /// Full old content
    Snapshot,
    /// A directory existed
    Dir,
}

impl IncrementAction {
    /// File name tag
    pub fn tag(&self) -> &'static str {
        match self {
            IncrementAction::Diff => "diff",
            IncrementAction::Missing => "missing",
            IncrementAction::Snapshot => "snapshot",
            IncrementAction::Dir => "dir",
        }
    }

    /// Parse a file name tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "diff" => Some(IncrementAction::Diff),
            "missing" => Some(IncrementAction::Missing),
            "snapshot" => Some(IncrementAction::Snapshot),
            "dir" => Some(IncrementAction::Dir),
            _ => None,
        }
    }
}

/// Identity of one increment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncrementName {
    /// Entry it belongs to (never the root)
    pub index: Index,
    /// Session whose state it restores
    pub time: SessionId,
    /// What it records
    pub action: IncrementAction,
}

impl IncrementName {
    /// Create an increment name
    pub fn new(index: Index, time: SessionId, action: IncrementAction) -> Self {
        Self {
            index,
            time,
            action,
        }
    }

    fn file_name(&self) -> Result<Vec<u8>> {
        let base = self
            .index
            .name()
            .ok_or_else(|| RetraceError::internal("the tree root has no increments"))?;
        let mut name = base.to_vec();
        name.extend_from_slice(format!(".{}.{}", self.time.quoted(), self.action.tag()).as_bytes());
        Ok(name)
    }

    /// Parse the file name of an increment found at `index`'s parent
    ///
    /// Returns `None` for anything that is not an increment name.
    pub fn parse(parent: &Index, file_name: &[u8]) -> Option<Self> {
        let mut parts = file_name.rsplitn(3, |&b| b == b'.');
        let tag = std::str::from_utf8(parts.next()?).ok()?;
        let time = std::str::from_utf8(parts.next()?).ok()?;
        let base = parts.next().filter(|b| !b.is_empty())?;
        Some(Self {
            index: parent.child(base),
            time: SessionId::parse(time).ok()?,
            action: IncrementAction::from_tag(tag)?,
        })
    }
}

/// The `increments/` directory of a mirror
#[derive(Debug, Clone)]
pub struct IncrementStore {
    root: PathBuf,
    fsync: bool,
}

impl IncrementStore {
    /// Open (creating if needed) the store at `root`
    pub fn open(root: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, fsync })
    }

    /// Store directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of an increment
    pub fn path_for(&self, name: &IncrementName) -> Result<PathBuf> {
        let parent = name
            .index
            .parent()
            .ok_or_else(|| RetraceError::internal("the tree root has no increments"))?;
        Ok(parent
            .to_path(&self.root)
            .join(crate::record::bytes_to_os(&name.file_name()?)))
    }

    /// Whether an increment is already committed
    pub fn exists(&self, name: &IncrementName) -> Result<bool> {
        Ok(fs::symlink_metadata(self.path_for(name)?).is_ok())
    }

    /// Increment of `index` stored under `time`, whatever its action
    pub fn find_at(&self, index: &Index, time: &SessionId) -> Result<Option<IncrementName>> {
        Ok(self
            .list_for(index)?
            .into_iter()
            .find(|name| name.time == *time))
    }

    /// Move a committed increment to `aside` while its replacement is written
    pub fn set_aside(&self, name: &IncrementName, aside: &Path) -> Result<()> {
        let path = self.path_for(name)?;
        fs::rename(&path, aside)?;
        if self.fsync {
            if let Some(parent) = path.parent() {
                fsutil::sync_dir(parent)?;
            }
        }
        debug!("Set aside increment {:?}", path);
        Ok(())
    }

    /// Pick a temporary name next to where `name` will be committed
    pub fn temp_for(&self, name: &IncrementName) -> Result<PathBuf> {
        Ok(fsutil::temp_sibling(&self.path_for(name)?))
    }

    /// Write `content` to `temp` durably, creating parent directories
    pub fn write_temp(&self, temp: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent)?;
        }
        fsutil::write_durable(temp, content, self.fsync)?;
        trace!("Wrote increment temp {:?} ({} bytes)", temp, content.len());
        Ok(())
    }

    /// Rename a written temp to the final increment name
    ///
    /// # Errors
    ///
    /// - [`RetraceError::IncrementExists`] if the increment is already there
    pub fn commit(&self, temp: &Path, name: &IncrementName) -> Result<PathBuf> {
        let target = self.path_for(name)?;
        if fs::symlink_metadata(&target).is_ok() {
            return Err(RetraceError::IncrementExists(target));
        }
        fs::rename(temp, &target)?;
        if self.fsync {
            if let Some(parent) = target.parent() {
                fsutil::sync_dir(parent)?;
            }
        }
        debug!("Committed increment {:?}", target);
        Ok(target)
    }

    /// Read a committed increment
    pub fn read(&self, name: &IncrementName) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_for(name)?)?)
    }

    /// Increments of one entry, oldest first
    pub fn list_for(&self, index: &Index) -> Result<Vec<IncrementName>> {
        let (Some(parent), Some(base)) = (index.parent(), index.name()) else {
            return Ok(Vec::new());
        };
        let dir = parent.to_path(&self.root);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = Index::from_relative(Path::new(&entry.file_name()));
            let Some(raw) = file_name.name() else { continue };
            if let Some(name) = IncrementName::parse(&parent, raw) {
                if name.index.name() == Some(base) {
                    found.push(name);
                }
            }
        }
        found.sort_by_key(|name| (name.time, name.action.tag()));
        Ok(found)
    }

    /// Every committed increment, in path order
    pub fn list_all(&self) -> Result<Vec<IncrementName>> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let index = Index::from_relative(relative);
            if let (Some(parent), Some(raw)) = (index.parent(), index.name()) {
                if let Some(name) = IncrementName::parse(&parent, raw) {
                    found.push(name);
                }
            }
        }
        Ok(found)
    }

    /// Remove stray temporary files left by an interrupted run
    pub fn remove_stray_temps(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() && fsutil::is_temp_name(entry.file_name()) {
                fs::remove_file(entry.path())?;
                debug!("Removed stray temp {:?}", entry.path());
                removed += 1;
            }
        }
        Ok(removed)
    }
}
