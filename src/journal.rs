//! Write-ahead journal and crash recovery
//!
//! Every mirror mutation that travels with an increment is bracketed by one
//! journal entry: the entry is made durable before the first byte of the
//! increment or the mirror changes, and it is removed once both are in their
//! final form. An entry that exists means a mutation is pending.
//!
//! Entries are small JSON files under `retrace-data/journal/`, one per index,
//! named after the SHA-256 of the index. Each is written with an atomic
//! rename, so an entry is either absent or complete.
//!
//! ## Recovery
//!
//! [`Journal::recover`] runs when a mirror is opened. For each pending entry:
//!
//! - If the planned increment is committed and the mirror object matches the
//!   expected outcome, the mutation landed. Temporaries are discarded.
//! - Otherwise the entry is rolled back: temporaries are discarded, an
//!   increment this entry committed is removed, and a mirror object or an
//!   older increment that was moved aside is moved back.
//!
//! A moved-aside mirror object that cannot be cleaned up is reported and left
//! in place; it never keeps the entry pending.
//!
//! Recovery never replays a delta; the next session recomputes whatever was
//! rolled back. Every step tolerates having already been done, so running
//! recovery twice is the same as running it once.

use crate::error::{Result, RetraceError};
use crate::fsutil::{self, atomic_write, hash_data, is_temp_name};
use crate::record::{FileAttrs, FileType, Index};
use crate::transport::Transport;
use crate::types::{RecoveryReport, SessionId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What the mirror object must look like once the mutation has landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorOutcome {
    /// Nothing at the target
    Absent,
    /// A regular file with this SHA-256 fingerprint
    Fingerprint(String),
    /// A directory
    Directory,
    /// A symlink to this target
    Symlink(Vec<u8>),
    /// A fifo or device node
    Special,
}

impl MirrorOutcome {
    fn is_met(&self, mirror: &dyn Transport, target: &Path) -> Result<bool> {
        let attrs = mirror.stat(target, false)?;
        Ok(match (self, &attrs) {
            (MirrorOutcome::Absent, FileAttrs::Missing) => true,
            (MirrorOutcome::Fingerprint(expected), FileAttrs::Regular { .. }) => {
                hash_data(&mirror.read(target)?) == *expected
            }
            (MirrorOutcome::Directory, FileAttrs::Directory { .. }) => true,
            (MirrorOutcome::Symlink(expected), FileAttrs::Symlink { target, .. }) => target == expected,
            (MirrorOutcome::Special, FileAttrs::Fifo { .. } | FileAttrs::Device { .. }) => true,
            _ => false,
        })
    }
}

/// One pending mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Session that opened the entry
    pub session: SessionId,
    /// Entry being mutated
    pub index: Index,
    /// Type of the source object
    pub file_type: FileType,
    /// Temporary name of the increment artifact
    pub increment_temp: Option<PathBuf>,
    /// Final name of the increment artifact
    pub increment_target: Option<PathBuf>,
    /// Temporary name of the new mirror object
    pub mirror_temp: Option<PathBuf>,
    /// Where an old mirror object is moved aside while it is replaced
    pub displaced: Option<PathBuf>,
    /// Increment of the same entry and session that this one replaces
    #[serde(default)]
    pub superseded: Option<PathBuf>,
    /// Where the replaced increment waits until the mutation has landed
    #[serde(default)]
    pub superseded_aside: Option<PathBuf>,
    /// Mirror path being mutated
    pub mirror_target: PathBuf,
    /// Expected state of `mirror_target` after the mutation
    pub expected: MirrorOutcome,
}

/// How a pending entry was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The mutation had landed
    Completed,
    /// The mutation was undone
    RolledBack,
}

/// The `journal/` directory of a mirror
#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
    fsync: bool,
}

impl Journal {
    /// Open (creating if needed) the journal at `dir`
    pub fn open(dir: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, fsync })
    }

    fn entry_path(&self, index: &Index) -> Result<PathBuf> {
        let key = hash_data(&serde_json::to_vec(index)?);
        Ok(self.dir.join(format!("{}.json", key)))
    }

    /// Make `entry` durable before its mutation starts
    ///
    /// # Errors
    ///
    /// - [`RetraceError::JournalConflict`] if an entry for the index is live
    /// - [`RetraceError::Durability`] if the entry cannot be written
    pub fn begin(&self, entry: &JournalEntry) -> Result<()> {
        let path = self.entry_path(&entry.index)?;
        if path.exists() {
            return Err(RetraceError::JournalConflict(entry.index.to_string()));
        }
        let bytes = serde_json::to_vec_pretty(entry)?;
        atomic_write(&path, &bytes, self.fsync)
            .map_err(|e| RetraceError::durability(format!("journal write failed: {}", e)))?;
        debug!("Journal begin {}", entry.index);
        Ok(())
    }

    /// Remove the entry once its mutation has landed
    pub fn commit(&self, index: &Index) -> Result<()> {
        let path = self.entry_path(index)?;
        fs::remove_file(&path)
            .map_err(|e| RetraceError::durability(format!("journal commit failed: {}", e)))?;
        if self.fsync {
            fsutil::sync_dir(&self.dir)
                .map_err(|e| RetraceError::durability(format!("journal fsync failed: {}", e)))?;
        }
        debug!("Journal commit {}", index);
        Ok(())
    }

    /// Entries still pending, in index order
    pub fn pending(&self) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if is_temp_name(&dirent.file_name()) {
                continue;
            }
            let bytes = fs::read(dirent.path())?;
            match serde_json::from_slice::<JournalEntry>(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    return Err(RetraceError::durability(format!(
                        "unreadable journal entry {:?}: {}",
                        dirent.path(),
                        e
                    )))
                }
            }
        }
        entries.sort_by(|a, b| a.index.cmp(&b.index));
        Ok(entries)
    }

    /// Whether no mutation is pending
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.pending()?.is_empty())
    }

    /// Resolve every pending entry and remove stray journal temporaries
    pub fn recover(&self, mirror: &dyn Transport) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if is_temp_name(&dirent.file_name()) {
                fs::remove_file(dirent.path())?;
                report.temps_removed += 1;
            }
        }
        for entry in self.pending()? {
            match self.resolve(&entry, mirror)? {
                Resolution::Completed => report.completed += 1,
                Resolution::RolledBack => report.rolled_back += 1,
            }
        }
        if report.completed + report.rolled_back > 0 {
            info!(
                "Journal recovery: {} completed, {} rolled back",
                report.completed, report.rolled_back
            );
        }
        Ok(report)
    }

    /// Resolve one pending entry and remove it
    ///
    /// Also used by the writer to undo a mutation that failed part way.
    pub fn resolve(&self, entry: &JournalEntry, mirror: &dyn Transport) -> Result<Resolution> {
        let increment_done = match &entry.increment_target {
            Some(target) => fs::symlink_metadata(target).is_ok(),
            None => true,
        };
        let mirror_done = increment_done && entry.expected.is_met(mirror, &entry.mirror_target)?;

        if let Some(temp) = &entry.increment_temp {
            remove_local(temp)?;
        }
        if let Some(temp) = &entry.mirror_temp {
            remove_any(mirror, temp)?;
        }

        let resolution = if mirror_done {
            if let Some(aside) = &entry.superseded_aside {
                remove_local(aside)?;
            }
            if let Some(displaced) = &entry.displaced {
                if let Err(e) = remove_any(mirror, displaced) {
                    warn!("Leaving displaced {:?} of {} in place: {}", displaced, entry.index, e);
                }
            }
            Resolution::Completed
        } else {
            undo_increment(entry)?;
            if let Some(displaced) = &entry.displaced {
                if let Err(e) = move_back(mirror, displaced, &entry.mirror_target) {
                    warn!("Could not move {:?} back to {:?}: {}", displaced, entry.mirror_target, e);
                }
            }
            warn!("Rolled back interrupted update of {}", entry.index);
            Resolution::RolledBack
        };

        let path = self.entry_path(&entry.index)?;
        remove_local(&path)?;
        if self.fsync {
            fsutil::sync_dir(&self.dir)?;
        }
        Ok(resolution)
    }
}

/// Remove the increment an unfinished entry committed and put back the one
/// it replaced
fn undo_increment(entry: &JournalEntry) -> Result<()> {
    match (&entry.superseded, &entry.superseded_aside) {
        (Some(original), Some(aside)) => {
            // without the aside copy, the increment at the target is still the old one
            if fs::symlink_metadata(aside).is_ok() {
                if let Some(target) = &entry.increment_target {
                    remove_local(target)?;
                }
                fs::rename(aside, original)?;
            }
        }
        _ => {
            if let Some(target) = &entry.increment_target {
                remove_local(target)?;
            }
        }
    }
    Ok(())
}

fn move_back(mirror: &dyn Transport, displaced: &Path, target: &Path) -> Result<()> {
    if mirror.stat(displaced, false)?.exists() {
        remove_any(mirror, target)?;
        mirror.rename(displaced, target)?;
    }
    Ok(())
}

fn remove_local(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove whatever is at `path` through the mirror transport, if anything
fn remove_any(mirror: &dyn Transport, path: &Path) -> Result<()> {
    match mirror.stat(path, false)? {
        FileAttrs::Missing => Ok(()),
        FileAttrs::Directory { .. } => mirror.remove_dir(path),
        _ => mirror.remove(path),
    }
}
