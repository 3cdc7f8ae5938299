//! Diff engine: per-entry change classification
//!
//! The [`DiffEngine`] turns one [`PairedEntry`] into a [`Plan`]: the
//! [`Action`] taken, the record to log, what must happen to the mirror, and
//! the increment artifact that lets the change be undone.
//!
//! ## Decision table
//!
//! | Source | Mirror | Action | Increment |
//! |---|---|---|---|
//! | present | absent | `New` | `missing` marker |
//! | present, content or type differs | present | `Diff` | reverse delta, or snapshot |
//! | present, same content, attributes differ | present | `MetadataOnly` | none |
//! | absent | present | `Deleted` | snapshot (`dir` marker for directories) |
//! | same | same | `Unchanged` | none |
//!
//! ## Content comparison
//!
//! Regular files of equal size and mtime are taken to have the same
//! content; different sizes always differ. Otherwise SHA-256 fingerprints
//! decide, reusing a fingerprint already carried by the mirror record.
//!
//! ## Deltas
//!
//! For a changed regular file the new mirror content is produced by
//! patching the old mirror content with a forward delta computed against the
//! mirror's signature. The increment is the reverse delta (old content
//! against the signature of the new content), unless its encoded size
//! exceeds `delta_size_ratio` times the old content's size, in which case
//! the old content is stored whole.
//!
//! ## Errors
//!
//! A read failure on either side surfaces as [`RetraceError::TransientIo`].
//! [`DiffEngine::plan`] retries such an entry once as a plain snapshot before
//! giving up; nothing is written while planning.

use crate::config::RetraceConfig;
use crate::delta::{block_size_for, delta, patch, signature};
use crate::error::{ErrorClass, Result, RetraceError};
use crate::fsutil::hash_data;
use crate::increment::IncrementAction;
use crate::record::{FileAttrs, FileRecord, Index};
use crate::transport::Transport;
use crate::types::Action;
use crate::walker::PairedEntry;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Reverse information for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementArtifact {
    /// Nothing existed before
    Missing,
    /// Full old content (symlink target for symlinks, empty for special files)
    Snapshot(Vec<u8>),
    /// Encoded reverse delta
    Diff(Vec<u8>),
    /// A directory existed before
    Dir,
}

impl IncrementArtifact {
    /// Increment tag this artifact is stored under
    pub fn action(&self) -> IncrementAction {
        match self {
            IncrementArtifact::Missing => IncrementAction::Missing,
            IncrementArtifact::Snapshot(_) => IncrementAction::Snapshot,
            IncrementArtifact::Diff(_) => IncrementAction::Diff,
            IncrementArtifact::Dir => IncrementAction::Dir,
        }
    }

    /// Bytes to store
    pub fn content(&self) -> &[u8] {
        match self {
            IncrementArtifact::Snapshot(bytes) | IncrementArtifact::Diff(bytes) => bytes,
            IncrementArtifact::Missing | IncrementArtifact::Dir => &[],
        }
    }
}

/// What has to happen to the mirror entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorUpdate {
    /// Leave it alone
    Nothing,
    /// Write a regular file with this content
    WriteFile(Vec<u8>),
    /// Create a symlink
    Symlink(Vec<u8>),
    /// Create a fifo or device node from the source attributes
    Special,
    /// Create a directory
    Mkdir,
    /// Apply the source attributes in place
    SetAttrs,
    /// Remove a non-directory
    Remove,
    /// Remove a directory once its children are gone
    RemoveDir,
}

/// The engine's decision for one entry
#[derive(Debug, Clone)]
pub struct Plan {
    /// Entry position
    pub index: Index,
    /// Classification
    pub action: Action,
    /// Source record to log (fingerprinted for regular files when known)
    pub source: Option<FileRecord>,
    /// Mirror record before the change
    pub mirror: Option<FileRecord>,
    /// Mirror mutation
    pub update: MirrorUpdate,
    /// Reverse information, `None` when the change needs none
    pub increment: Option<IncrementArtifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Delta,
    Snapshot,
}

/// Classifies paired entries
pub struct DiffEngine<'a> {
    source: &'a dyn Transport,
    source_root: &'a Path,
    mirror: &'a dyn Transport,
    mirror_root: &'a Path,
    config: &'a RetraceConfig,
    increments: bool,
}

impl<'a> DiffEngine<'a> {
    /// Create an engine over two sides
    ///
    /// With `increments` false (the first session of a mirror) no reverse
    /// information is computed.
    pub fn new(
        source: &'a dyn Transport,
        source_root: &'a Path,
        mirror: &'a dyn Transport,
        mirror_root: &'a Path,
        config: &'a RetraceConfig,
        increments: bool,
    ) -> Self {
        Self {
            source,
            source_root,
            mirror,
            mirror_root,
            config,
            increments,
        }
    }

    /// Decide what to do with one entry
    ///
    /// # Errors
    ///
    /// - [`RetraceError::TransientIo`] if reading fails twice
    /// - [`RetraceError::PermissionDenied`] if a side cannot be read
    /// - [`RetraceError::UnsupportedFileType`] for sockets
    pub fn plan(&self, entry: &PairedEntry) -> Result<Plan> {
        match self.plan_with(entry, Strategy::Delta) {
            Err(e) if e.class() == ErrorClass::TransientIo => {
                warn!("Retrying {} as a snapshot after: {}", entry.index, e);
                self.plan_with(entry, Strategy::Snapshot)
            }
            other => other,
        }
    }

    fn plan_with(&self, entry: &PairedEntry, strategy: Strategy) -> Result<Plan> {
        let plan = match (&entry.source, &entry.mirror) {
            (None, None) => Plan {
                index: entry.index.clone(),
                action: Action::Unchanged,
                source: None,
                mirror: None,
                update: MirrorUpdate::Nothing,
                increment: None,
            },
            (Some(src), None) => self.plan_new(src)?,
            (None, Some(mir)) => self.plan_deleted(mir)?,
            (Some(src), Some(mir)) if src.file_type() != mir.file_type() => {
                self.plan_type_change(src, mir)?
            }
            (Some(src), Some(mir)) => self.plan_same_type(src, mir, strategy)?,
        };
        debug!("{} -> {:?}", plan.index, plan.action);
        Ok(plan)
    }

    fn read_source(&self, index: &Index) -> Result<Vec<u8>> {
        self.source.read(&index.to_path(self.source_root))
    }

    fn read_mirror(&self, index: &Index) -> Result<Vec<u8>> {
        self.mirror.read(&index.to_path(self.mirror_root))
    }

    /// Update that recreates `src` in the mirror, plus its logged record
    fn creation(&self, src: &FileRecord) -> Result<(FileRecord, MirrorUpdate)> {
        Ok(match &src.attrs {
            FileAttrs::Regular { .. } => {
                let content = self.read_source(&src.index)?;
                let record = FileRecord::new(
                    src.index.clone(),
                    src.attrs.clone().with_fingerprint(hash_data(&content)),
                );
                (record, MirrorUpdate::WriteFile(content))
            }
            FileAttrs::Directory { .. } => (src.clone(), MirrorUpdate::Mkdir),
            FileAttrs::Symlink { target, .. } => (src.clone(), MirrorUpdate::Symlink(target.clone())),
            FileAttrs::Fifo { .. } | FileAttrs::Device { .. } => (src.clone(), MirrorUpdate::Special),
            FileAttrs::Socket { .. } | FileAttrs::Missing => {
                return Err(RetraceError::UnsupportedFileType {
                    path: src.index.to_path(self.source_root),
                })
            }
        })
    }

    /// Increment that restores `mir` as it is now
    fn snapshot_of(&self, mir: &FileRecord) -> Result<Option<IncrementArtifact>> {
        if !self.increments {
            return Ok(None);
        }
        Ok(Some(match &mir.attrs {
            FileAttrs::Regular { .. } => IncrementArtifact::Snapshot(self.read_mirror(&mir.index)?),
            FileAttrs::Directory { .. } => IncrementArtifact::Dir,
            FileAttrs::Symlink { target, .. } => IncrementArtifact::Snapshot(target.clone()),
            _ => IncrementArtifact::Snapshot(Vec::new()),
        }))
    }

    fn plan_new(&self, src: &FileRecord) -> Result<Plan> {
        let (record, update) = self.creation(src)?;
        Ok(Plan {
            index: src.index.clone(),
            action: Action::New,
            source: Some(record),
            mirror: None,
            update,
            increment: self.increments.then_some(IncrementArtifact::Missing),
        })
    }

    fn plan_deleted(&self, mir: &FileRecord) -> Result<Plan> {
        let update = if mir.attrs.is_dir() {
            MirrorUpdate::RemoveDir
        } else {
            MirrorUpdate::Remove
        };
        Ok(Plan {
            index: mir.index.clone(),
            action: Action::Deleted,
            source: None,
            mirror: Some(mir.clone()),
            update,
            increment: self.snapshot_of(mir)?,
        })
    }

    fn plan_type_change(&self, src: &FileRecord, mir: &FileRecord) -> Result<Plan> {
        let (record, update) = self.creation(src)?;
        Ok(Plan {
            index: src.index.clone(),
            action: Action::Diff,
            source: Some(record),
            mirror: Some(mir.clone()),
            update,
            increment: self.snapshot_of(mir)?,
        })
    }

    fn plan_same_type(&self, src: &FileRecord, mir: &FileRecord, strategy: Strategy) -> Result<Plan> {
        let index = src.index.clone();
        let unchanged_or_attrs = |record: FileRecord| {
            let same = record.attrs.same_metadata(&mir.attrs);
            Plan {
                index: index.clone(),
                action: if same { Action::Unchanged } else { Action::MetadataOnly },
                source: Some(record),
                mirror: Some(mir.clone()),
                update: if same { MirrorUpdate::Nothing } else { MirrorUpdate::SetAttrs },
                increment: None,
            }
        };

        match (&src.attrs, &mir.attrs) {
            (FileAttrs::Regular { .. }, FileAttrs::Regular { .. }) => {
                self.plan_regular(src, mir, strategy, unchanged_or_attrs)
            }
            (
                FileAttrs::Symlink { target: new, .. },
                FileAttrs::Symlink { target: old, .. },
            ) if new != old => Ok(Plan {
                index: index.clone(),
                action: Action::Diff,
                source: Some(src.clone()),
                mirror: Some(mir.clone()),
                update: MirrorUpdate::Symlink(new.clone()),
                increment: self.snapshot_of(mir)?,
            }),
            (
                FileAttrs::Device { kind: k1, major: ma1, minor: mi1, .. },
                FileAttrs::Device { kind: k2, major: ma2, minor: mi2, .. },
            ) if (k1, ma1, mi1) != (k2, ma2, mi2) => Ok(Plan {
                index: index.clone(),
                action: Action::Diff,
                source: Some(src.clone()),
                mirror: Some(mir.clone()),
                update: MirrorUpdate::Special,
                increment: self.snapshot_of(mir)?,
            }),
            (FileAttrs::Socket { .. }, _) => Err(RetraceError::UnsupportedFileType {
                path: index.to_path(self.source_root),
            }),
            _ => Ok(unchanged_or_attrs(src.clone())),
        }
    }

    fn plan_regular(
        &self,
        src: &FileRecord,
        mir: &FileRecord,
        strategy: Strategy,
        unchanged_or_attrs: impl Fn(FileRecord) -> Plan,
    ) -> Result<Plan> {
        let index = &src.index;
        let (src_size, mir_size) = (src.attrs.size(), mir.attrs.size());

        if src_size == mir_size && src.attrs.mtime() == mir.attrs.mtime() {
            trace!("{}: size and mtime match", index);
            let record = match mir.attrs.fingerprint() {
                Some(hash) => FileRecord::new(index.clone(), src.attrs.clone().with_fingerprint(hash.to_string())),
                None => src.clone(),
            };
            return Ok(unchanged_or_attrs(record));
        }

        let new_content = self.read_source(index)?;
        let new_hash = hash_data(&new_content);
        let record = FileRecord::new(index.clone(), src.attrs.clone().with_fingerprint(new_hash.clone()));

        let mut old_content = None;
        if src_size == mir_size {
            let old_hash = match mir.attrs.fingerprint() {
                Some(hash) => hash.to_string(),
                None => {
                    let content = self.read_mirror(index)?;
                    let hash = hash_data(&content);
                    old_content = Some(content);
                    hash
                }
            };
            if old_hash == new_hash {
                return Ok(unchanged_or_attrs(record));
            }
        }

        let old_content = match old_content {
            Some(content) => content,
            None => self.read_mirror(index)?,
        };
        let (new_mirror, increment) = match strategy {
            Strategy::Delta => self.delta_pair(&old_content, &new_content)?,
            Strategy::Snapshot => {
                let increment = self
                    .increments
                    .then(|| IncrementArtifact::Snapshot(old_content));
                (new_content, increment)
            }
        };

        Ok(Plan {
            index: index.clone(),
            action: Action::Diff,
            source: Some(record),
            mirror: Some(mir.clone()),
            update: MirrorUpdate::WriteFile(new_mirror),
            increment,
        })
    }

    fn block_size(&self, len: usize) -> usize {
        self.config
            .block_size
            .unwrap_or_else(|| block_size_for(len as u64))
    }

    /// New mirror content via the forward delta, and the reverse increment
    fn delta_pair(&self, old: &[u8], new: &[u8]) -> Result<(Vec<u8>, Option<IncrementArtifact>)> {
        let forward = delta(&signature(old, self.block_size(old.len())), new);
        let new_mirror = patch(old, &forward)?;
        trace!(
            "forward delta: {} ops, {} literal bytes",
            forward.ops.len(),
            forward.literal_bytes()
        );

        if !self.increments {
            return Ok((new_mirror, None));
        }
        let reverse = delta(&signature(&new_mirror, self.block_size(new_mirror.len())), old);
        let encoded = reverse.encode()?;
        let threshold = self.config.delta_size_ratio * old.len() as f64;
        let increment = if encoded.len() as f64 > threshold {
            trace!("reverse delta {} bytes over threshold {:.0}, storing snapshot", encoded.len(), threshold);
            IncrementArtifact::Snapshot(old.to_vec())
        } else {
            IncrementArtifact::Diff(encoded)
        };
        Ok((new_mirror, Some(increment)))
    }
}
