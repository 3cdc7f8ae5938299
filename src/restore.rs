//! Restoring earlier states
//!
//! The mirror always holds the newest state. The state as of an earlier
//! finalized session `S` is rebuilt by starting from the mirror and applying,
//! newest first, every increment of the path whose time is `S` or later:
//!
//! - `diff`: patch the current content with the stored reverse delta
//! - `snapshot`: replace the current content
//! - `missing` / `dir`: there was no regular file
//!
//! Which paths existed at `S`, and with which attributes, comes from the
//! metadata log of `S`. Restored content is checked against the fingerprint
//! recorded there.

use crate::delta::{patch, Delta};
use crate::error::{Result, RetraceError};
use crate::fsutil::{self, AttrOptions};
use crate::increment::{IncrementAction, IncrementStore};
use crate::metadata::{find_record, records_of};
use crate::mirror::DataDir;
use crate::record::{FileAttrs, FileRecord, Index};
use crate::transport::Transport;
use crate::types::SessionId;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// One path as it was at a session
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredFile {
    /// Record logged by that session
    pub record: FileRecord,
    /// Content, for regular files
    pub content: Option<Vec<u8>>,
}

/// What [`Restorer::restore_tree`] produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Regular files written
    pub files: usize,
    /// Directories created
    pub directories: usize,
    /// Symlinks and special files created
    pub others: usize,
    /// Records that could not be restored
    pub skipped: usize,
    /// Bytes of file content written
    pub bytes: u64,
}

/// Reads earlier states out of a mirror
pub struct Restorer<'a> {
    transport: &'a dyn Transport,
    mirror_root: &'a Path,
    data: &'a DataDir,
    increments: &'a IncrementStore,
}

impl<'a> Restorer<'a> {
    /// Create a restorer over a mirror's tree and data directory
    pub fn new(
        transport: &'a dyn Transport,
        mirror_root: &'a Path,
        data: &'a DataDir,
        increments: &'a IncrementStore,
    ) -> Self {
        Self {
            transport,
            mirror_root,
            data,
            increments,
        }
    }

    fn check_session(&self, as_of: &SessionId) -> Result<()> {
        let finalized = self
            .data
            .current_session()?
            .is_some_and(|current| *as_of <= current);
        if !finalized || !self.data.log_path(as_of).exists() {
            return Err(RetraceError::SessionNotFound(as_of.quoted()));
        }
        Ok(())
    }

    /// Rebuild one path as of `as_of`
    ///
    /// # Errors
    ///
    /// - [`RetraceError::SessionNotFound`] if `as_of` is not a finalized session
    /// - [`RetraceError::NothingToRestore`] if the path did not exist then
    /// - [`RetraceError::InvalidDelta`] if the increment chain is inconsistent
    pub fn restore_file(&self, index: &Index, as_of: &SessionId) -> Result<RestoredFile> {
        self.check_session(as_of)?;
        let record = find_record(&self.data.log_path(as_of), index)?
            .filter(|record| record.attrs.exists())
            .ok_or_else(|| RetraceError::NothingToRestore(index.to_string()))?;
        self.restore_record(record, as_of)
    }

    fn restore_record(&self, record: FileRecord, as_of: &SessionId) -> Result<RestoredFile> {
        if !record.attrs.is_regular() {
            return Ok(RestoredFile {
                record,
                content: None,
            });
        }
        let content = self
            .content_at(&record.index, as_of)?
            .ok_or_else(|| RetraceError::InvalidDelta(format!("no content for {} at {}", record.index, as_of)))?;

        if content.len() as u64 != record.attrs.size() {
            return Err(RetraceError::InvalidDelta(format!(
                "{} restored to {} bytes, expected {}",
                record.index,
                content.len(),
                record.attrs.size()
            )));
        }
        if let Some(expected) = record.attrs.fingerprint() {
            if fsutil::hash_data(&content) != expected {
                return Err(RetraceError::InvalidDelta(format!(
                    "{} does not match its recorded fingerprint",
                    record.index
                )));
            }
        }
        Ok(RestoredFile {
            record,
            content: Some(content),
        })
    }

    /// Regular-file content of `index` at `as_of`, `None` if it was not a
    /// regular file then
    fn content_at(&self, index: &Index, as_of: &SessionId) -> Result<Option<Vec<u8>>> {
        let path = index.to_path(self.mirror_root);
        let mut state = match self.transport.stat(&path, false)? {
            FileAttrs::Regular { .. } => Some(self.transport.read(&path)?),
            _ => None,
        };

        let mut chain = self.increments.list_for(index)?;
        chain.retain(|name| name.time >= *as_of);
        for name in chain.iter().rev() {
            state = match name.action {
                IncrementAction::Snapshot => Some(self.increments.read(name)?),
                IncrementAction::Missing | IncrementAction::Dir => None,
                IncrementAction::Diff => {
                    let newer = state.ok_or_else(|| {
                        RetraceError::InvalidDelta(format!("diff increment for {} has no newer content", index))
                    })?;
                    let reverse = Delta::decode(&self.increments.read(name)?)?;
                    Some(patch(&newer, &reverse)?)
                }
            };
            debug!("Applied {} increment of {} from {}", name.action.tag(), index, name.time);
        }
        Ok(state)
    }

    /// Rebuild the whole tree as of `as_of` under `dest`
    ///
    /// `dest` is created if needed. Entries that cannot be rebuilt are
    /// counted and skipped.
    pub fn restore_tree(&self, as_of: &SessionId, dest: &Path) -> Result<RestoreSummary> {
        self.check_session(as_of)?;
        info!("Restoring session {} into {:?}", as_of, dest);
        fs::create_dir_all(dest)?;

        let mut summary = RestoreSummary::default();
        let mut dirs = Vec::new();
        for record in records_of(&self.data.log_path(as_of))? {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable record: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            };
            let target = record.index.to_path(dest);
            if let Err(e) = self.restore_entry(&record, as_of, &target, &mut summary) {
                if e.is_fatal() && !matches!(e, RetraceError::InvalidDelta(_)) {
                    return Err(e);
                }
                warn!("Could not restore {}: {}", record.index, e);
                summary.skipped += 1;
                continue;
            }
            if record.attrs.is_dir() {
                dirs.push((target, record));
            }
        }

        for (path, record) in dirs.iter().rev() {
            fsutil::apply_attrs(path, &record.attrs, AttrOptions::default())?;
        }
        info!(
            "Restored {} files, {} directories, {} others ({} skipped)",
            summary.files, summary.directories, summary.others, summary.skipped
        );
        Ok(summary)
    }

    fn restore_entry(
        &self,
        record: &FileRecord,
        as_of: &SessionId,
        target: &Path,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        let io = |e: std::io::Error| RetraceError::transient(target, e);
        match &record.attrs {
            FileAttrs::Directory { .. } => {
                fs::create_dir_all(target).map_err(io)?;
                summary.directories += 1;
            }
            FileAttrs::Regular { .. } => {
                let restored = self.restore_record(record.clone(), as_of)?;
                let content = restored.content.unwrap_or_default();
                fsutil::write_durable(target, &content, false).map_err(io)?;
                fsutil::apply_attrs(target, &record.attrs, AttrOptions::default()).map_err(io)?;
                summary.files += 1;
                summary.bytes += content.len() as u64;
            }
            FileAttrs::Symlink { target: link, .. } => {
                fsutil::create_symlink(link, target).map_err(io)?;
                summary.others += 1;
            }
            FileAttrs::Fifo { .. } | FileAttrs::Device { .. } => {
                fsutil::make_special(target, &record.attrs).map_err(io)?;
                summary.others += 1;
            }
            FileAttrs::Socket { .. } | FileAttrs::Missing => {}
        }
        Ok(())
    }
}
