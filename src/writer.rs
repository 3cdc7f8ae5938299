//! Increment writer
//!
//! [`IncrementWriter::apply`] carries out one [`Plan`]: it commits the
//! increment, mutates the mirror and keeps the pair bracketed by a journal
//! entry so that a crash at any point can be resolved by recovery.
//!
//! The order of operations for a journaled mutation is:
//!
//! 1. look for an increment already stored for this entry and session
//! 2. make the journal entry durable
//! 3. move that older increment aside, if there is one
//! 4. write the increment under a temporary name, fsync, rename it into place
//! 5. build the new mirror object under a temporary name with its attributes
//!    and rename it over the target (directories are created in place)
//! 6. drop whatever was moved aside and remove the journal entry
//!
//! Replacing a directory with something else, or something else with a
//! directory, first moves the old object aside to a temporary name recorded
//! in the journal so that recovery can move it back. A directory that still
//! has children is never moved or removed.
//!
//! An older increment for the same session exists when an earlier run
//! crashed after its mutation landed. It describes the state the previous
//! session saw, so the new increment is rebuilt from it instead of from the
//! current mirror object, and replaces it.
//!
//! Attribute-only changes are applied in place without a journal entry.
//! Directory attributes are applied by [`IncrementWriter::finish_dir`] after
//! all children have been processed.

use crate::delta::{patch, Delta};
use crate::diff::{IncrementArtifact, MirrorUpdate, Plan};
use crate::error::{Result, RetraceError};
use crate::fsutil::{self, AttrOptions};
use crate::increment::{IncrementAction, IncrementName, IncrementStore};
use crate::journal::{Journal, JournalEntry, MirrorOutcome};
use crate::record::{FileAttrs, FileRecord, FileType};
use crate::transport::Transport;
use crate::types::SessionId;
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Where a test can make the writer fail on purpose
///
/// The injected failure is fatal, so the run aborts with the journal entry
/// of the first journaled mutation still pending.
#[cfg(any(test, feature = "fail-points"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// After the journal entry is durable, before anything else
    AfterJournalBegin,
    /// After the increment has been renamed into place
    AfterIncrementCommit,
    /// After the mirror has been updated, before the journal entry is removed
    BeforeJournalCommit,
}

/// What [`IncrementWriter::apply`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Final path of the committed increment, if one was written
    pub increment: Option<PathBuf>,
}

/// The increment a journaled mutation commits
struct PlannedIncrement<'p> {
    name: IncrementName,
    artifact: Cow<'p, IncrementArtifact>,
    superseded: Option<IncrementName>,
}

/// Applies plans to the mirror and the increment store
pub struct IncrementWriter<'a> {
    mirror: &'a dyn Transport,
    mirror_root: &'a Path,
    journal: &'a Journal,
    increments: &'a IncrementStore,
    session: SessionId,
    previous: Option<SessionId>,
    options: AttrOptions,
    fsync: bool,
    #[cfg(any(test, feature = "fail-points"))]
    fail_point: Option<FailPoint>,
}

impl<'a> IncrementWriter<'a> {
    /// Create a writer for `session`, which supersedes `previous`
    ///
    /// Without a previous session no increments are written.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mirror: &'a dyn Transport,
        mirror_root: &'a Path,
        journal: &'a Journal,
        increments: &'a IncrementStore,
        session: SessionId,
        previous: Option<SessionId>,
        options: AttrOptions,
        fsync: bool,
    ) -> Self {
        Self {
            mirror,
            mirror_root,
            journal,
            increments,
            session,
            previous,
            options,
            fsync,
            #[cfg(any(test, feature = "fail-points"))]
            fail_point: None,
        }
    }

    /// Fail on purpose when the given point is reached
    #[cfg(any(test, feature = "fail-points"))]
    pub fn with_fail_point(mut self, point: Option<FailPoint>) -> Self {
        self.fail_point = point;
        self
    }

    #[cfg(any(test, feature = "fail-points"))]
    fn fail(&self, point: FailPoint) -> Result<()> {
        if self.fail_point == Some(point) {
            return Err(RetraceError::internal(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn target(&self, plan: &Plan) -> PathBuf {
        plan.index.to_path(self.mirror_root)
    }

    /// Carry out `plan`
    ///
    /// A per-file failure after the journal entry was opened is rolled back
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`RetraceError::IncrementExists`] if an increment already stored for
    ///   this entry and session cannot be read back
    /// - [`RetraceError::DirectoryNotEmpty`] if a mirror directory that has to
    ///   go away still has children
    /// - per-file errors from the mirror transport
    /// - [`RetraceError::Durability`] if the journal cannot be written
    pub fn apply(&self, plan: &Plan) -> Result<WriteOutcome> {
        match &plan.update {
            MirrorUpdate::Nothing => Ok(WriteOutcome::default()),
            MirrorUpdate::SetAttrs => {
                if let Some(source) = plan.source.as_ref().filter(|s| !s.attrs.is_dir()) {
                    self.mirror
                        .set_attrs(&self.target(plan), &source.attrs, self.options)?;
                    trace!("Updated attributes of {}", plan.index);
                }
                Ok(WriteOutcome::default())
            }
            _ => self.apply_journaled(plan),
        }
    }

    fn planned_increment<'p>(&self, plan: &'p Plan) -> Result<Option<PlannedIncrement<'p>>> {
        let (Some(previous), Some(artifact)) = (self.previous, plan.increment.as_ref()) else {
            return Ok(None);
        };
        let (artifact, superseded) = match self.increments.find_at(&plan.index, &previous)? {
            Some(existing) => (Cow::Owned(self.rebase(plan, &existing)?), Some(existing)),
            None => (Cow::Borrowed(artifact), None),
        };
        Ok(Some(PlannedIncrement {
            name: IncrementName::new(plan.index.clone(), previous, artifact.action()),
            artifact,
            superseded,
        }))
    }

    /// The state `existing` restores, as an artifact that no longer depends
    /// on the current mirror object
    fn rebase(&self, plan: &Plan, existing: &IncrementName) -> Result<IncrementArtifact> {
        let path = self.increments.path_for(existing)?;
        let artifact = match existing.action {
            IncrementAction::Missing => IncrementArtifact::Missing,
            IncrementAction::Dir => IncrementArtifact::Dir,
            IncrementAction::Snapshot => IncrementArtifact::Snapshot(self.increments.read(existing)?),
            IncrementAction::Diff => {
                if !plan.mirror.as_ref().is_some_and(|m| m.attrs.is_regular()) {
                    return Err(RetraceError::IncrementExists(path));
                }
                let current = self.mirror.read(&self.target(plan))?;
                let older = Delta::decode(&self.increments.read(existing)?)
                    .and_then(|reverse| patch(&current, &reverse))
                    .map_err(|e| {
                        warn!("Cannot rebase {:?}: {}", path, e);
                        RetraceError::IncrementExists(path.clone())
                    })?;
                IncrementArtifact::Snapshot(older)
            }
        };
        info!(
            "Replacing {} increment of {} left by an interrupted run",
            existing.action.tag(),
            plan.index
        );
        Ok(artifact)
    }

    /// Refuse to move or remove a mirror directory that still has children
    fn check_empty_dir(&self, target: &Path) -> Result<()> {
        if !self.mirror.list(target)?.is_empty() {
            return Err(RetraceError::DirectoryNotEmpty(target.to_path_buf()));
        }
        Ok(())
    }

    fn apply_journaled(&self, plan: &Plan) -> Result<WriteOutcome> {
        let target = self.target(plan);
        let mirror_is_dir = plan.mirror.as_ref().is_some_and(|m| m.attrs.is_dir());
        let creates_dir = plan.update == MirrorUpdate::Mkdir;
        let replaces = plan.mirror.is_some() && plan.source.is_some() && mirror_is_dir != creates_dir;
        if mirror_is_dir && (replaces || plan.update == MirrorUpdate::RemoveDir) {
            self.check_empty_dir(&target)?;
        }

        let increment = self.planned_increment(plan)?;
        let superseded = match increment.as_ref().and_then(|inc| inc.superseded.as_ref()) {
            Some(name) => Some((self.increments.path_for(name)?, self.increments.temp_for(name)?)),
            None => None,
        };
        let entry = JournalEntry {
            session: self.session,
            index: plan.index.clone(),
            file_type: plan
                .source
                .as_ref()
                .map(FileRecord::file_type)
                .unwrap_or(FileType::Missing),
            increment_temp: match &increment {
                Some(inc) => Some(self.increments.temp_for(&inc.name)?),
                None => None,
            },
            increment_target: match &increment {
                Some(inc) => Some(self.increments.path_for(&inc.name)?),
                None => None,
            },
            mirror_temp: matches!(
                plan.update,
                MirrorUpdate::WriteFile(_) | MirrorUpdate::Symlink(_) | MirrorUpdate::Special
            )
            .then(|| fsutil::temp_sibling(&target)),
            displaced: replaces.then(|| fsutil::temp_sibling(&target)),
            superseded: superseded.as_ref().map(|(path, _)| path.clone()),
            superseded_aside: superseded.map(|(_, aside)| aside),
            mirror_target: target,
            expected: expected_outcome(plan)?,
        };

        self.journal.begin(&entry)?;
        #[cfg(any(test, feature = "fail-points"))]
        self.fail(FailPoint::AfterJournalBegin)?;

        let mut outcome = WriteOutcome::default();
        let result = self.mutate(plan, &entry, increment, &mut outcome);
        match result {
            Ok(()) => {
                #[cfg(any(test, feature = "fail-points"))]
                self.fail(FailPoint::BeforeJournalCommit)?;
                self.journal.commit(&plan.index)?;
                Ok(outcome)
            }
            Err(e) if e.is_per_file() => {
                warn!("Undoing partial update of {}: {}", plan.index, e);
                self.journal.resolve(&entry, self.mirror)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn mutate(
        &self,
        plan: &Plan,
        entry: &JournalEntry,
        increment: Option<PlannedIncrement<'_>>,
        outcome: &mut WriteOutcome,
    ) -> Result<()> {
        if let (Some(inc), Some(temp)) = (increment, &entry.increment_temp) {
            if let (Some(old), Some(aside)) = (&inc.superseded, &entry.superseded_aside) {
                self.increments.set_aside(old, aside)?;
            }
            self.increments.write_temp(temp, inc.artifact.content())?;
            outcome.increment = Some(self.increments.commit(temp, &inc.name)?);
            #[cfg(any(test, feature = "fail-points"))]
            self.fail(FailPoint::AfterIncrementCommit)?;
        }

        let target = &entry.mirror_target;
        if let Some(displaced) = &entry.displaced {
            self.mirror.rename(target, displaced)?;
        }

        match (&plan.update, &entry.mirror_temp) {
            (MirrorUpdate::Remove, _) => self.mirror.remove(target)?,
            (MirrorUpdate::RemoveDir, _) => self.mirror.remove_dir(target)?,
            (MirrorUpdate::Mkdir, _) => {
                self.mirror.mkdir(target)?;
                self.make_writable(target)?;
            }
            (update, Some(temp)) => {
                let source = plan
                    .source
                    .as_ref()
                    .ok_or_else(|| RetraceError::internal("creation without a source record"))?;
                match update {
                    MirrorUpdate::WriteFile(content) => {
                        self.mirror.write(temp, content.clone(), self.fsync)?
                    }
                    MirrorUpdate::Symlink(link) => self.mirror.symlink(link, temp)?,
                    _ => self.mirror.make_special(temp, &source.attrs)?,
                }
                self.mirror.set_attrs(temp, &source.attrs, self.options)?;
                self.mirror.rename(temp, target)?;
            }
            (update, None) => {
                return Err(RetraceError::internal(format!(
                    "no temporary planned for {:?}",
                    update
                )))
            }
        }

        if let Some(displaced) = &entry.displaced {
            match self.mirror.stat(displaced, false)? {
                FileAttrs::Directory { .. } => self.mirror.remove_dir(displaced)?,
                FileAttrs::Missing => {}
                _ => self.mirror.remove(displaced)?,
            }
        }
        if let Some(aside) = &entry.superseded_aside {
            fs::remove_file(aside)?;
        }
        debug!("Applied {:?} to {}", plan.action, plan.index);
        Ok(())
    }

    /// Give the owner full access to a mirror directory while its children
    /// are being written
    pub fn make_writable(&self, path: &Path) -> Result<()> {
        let mode = self.mirror.stat(path, false)?.perms().unwrap_or(0o700);
        if mode & 0o700 != 0o700 {
            self.mirror.set_mode(path, mode | 0o700)?;
            trace!("Made {:?} writable ({:o})", path, mode | 0o700);
        }
        Ok(())
    }

    /// Apply a directory's final attributes once its children are done
    pub fn finish_dir(&self, record: &FileRecord) -> Result<()> {
        let path = record.index.to_path(self.mirror_root);
        self.mirror.set_attrs(&path, &record.attrs, self.options)
    }
}

fn expected_outcome(plan: &Plan) -> Result<MirrorOutcome> {
    Ok(match &plan.update {
        MirrorUpdate::Remove | MirrorUpdate::RemoveDir => MirrorOutcome::Absent,
        MirrorUpdate::Mkdir => MirrorOutcome::Directory,
        MirrorUpdate::WriteFile(content) => MirrorOutcome::Fingerprint(fsutil::hash_data(content)),
        MirrorUpdate::Symlink(target) => MirrorOutcome::Symlink(target.clone()),
        MirrorUpdate::Special => MirrorOutcome::Special,
        MirrorUpdate::Nothing | MirrorUpdate::SetAttrs => {
            return Err(RetraceError::internal("update needs no journal entry"))
        }
    })
}
