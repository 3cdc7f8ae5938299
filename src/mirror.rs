//! Mirror sessions
//!
//! [`Mirror`] is the main entry point. It owns a mirror directory and its
//! backup-data directory and runs one backup session at a time:
//!
//! ```text
//! PairedWalker -> DiffEngine -> IncrementWriter (journaled) -> MetadataWriter
//! ```
//!
//! ## On-disk layout
//!
//! ```text
//! <mirror>/
//! ├── ...mirrored tree...
//! └── retrace-data/
//!     ├── current_mirror          # id of the last finalized session
//!     ├── config.json             # settings of the last finalized session
//!     ├── metadata.<session>.log  # one per session
//!     ├── increments/             # reverse information, mirroring the tree
//!     └── journal/                # pending mutations
//! ```
//!
//! ## Session lifecycle
//!
//! 1. Opening a mirror runs crash recovery.
//! 2. A session walks both trees, writes increments against the previous
//!    session and appends one record per entry to its own metadata log.
//!    An entry or directory that cannot be read is skipped: the mirror keeps
//!    it and the log carries its previous records forward.
//! 3. Directory attributes are applied after their children; directories
//!    that disappear are removed after their children.
//! 4. At every checkpoint the log is fsynced and a pending stop request is
//!    honoured.
//! 5. Finalizing checks that the journal is empty and atomically advances
//!    `current_mirror`. A session that never finalizes is discarded by the
//!    next recovery.
//!
//! ## Example
//!
//! ```rust,no_run
//! use retrace::RetraceBuilder;
//!
//! # fn main() -> retrace::Result<()> {
//! let mut mirror = RetraceBuilder::new()
//!     .exclude("**/target")
//!     .open("/backups/project")?;
//!
//! let report = mirror.backup_local("/home/me/project")?;
//! println!(
//!     "{}: {} new, {} changed, {} deleted",
//!     report.session, report.counts.new, report.counts.changed, report.counts.deleted
//! );
//! # Ok(())
//! # }
//! ```

use crate::config::RetraceConfig;
use crate::diff::{DiffEngine, Plan};
use crate::error::{ErrorClass, Result, RetraceError};
use crate::fsutil::{atomic_write, is_temp_name};
use crate::increment::{IncrementName, IncrementStore};
use crate::journal::Journal;
use crate::metadata::{log_file_name, parse_log_name, MetadataWriter, PriorRecords};
use crate::record::{FileAttrs, FileRecord, Index};
use crate::restore::Restorer;
use crate::transport::{LocalTransport, Transport};
use crate::types::{ChangeCounts, ProgressInfo, RecoveryReport, SessionId, SessionReport, SkippedEntry};
use crate::walker::{PairedEntry, PairedWalker, RelaxedDir, Side, WalkOptions, DATA_DIR_NAME};
use crate::writer::IncrementWriter;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Name of the marker holding the last finalized session id
pub const CURRENT_MIRROR: &str = "current_mirror";

/// Name of the persisted configuration
pub const CONFIG_FILE: &str = "config.json";

/// Paths inside `retrace-data/`
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Data directory of the mirror at `mirror_root`
    pub fn new(mirror_root: &Path) -> Self {
        Self {
            root: mirror_root.join(DATA_DIR_NAME),
        }
    }

    /// The `retrace-data` directory itself
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata log of a session
    pub fn log_path(&self, session: &SessionId) -> PathBuf {
        self.root.join(log_file_name(session))
    }

    /// Increment store directory
    pub fn increments_dir(&self) -> PathBuf {
        self.root.join("increments")
    }

    /// Journal directory
    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    /// Current-mirror marker
    pub fn marker_path(&self) -> PathBuf {
        self.root.join(CURRENT_MIRROR)
    }

    /// Persisted configuration
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Last finalized session, if any
    pub fn current_session(&self) -> Result<Option<SessionId>> {
        match fs::read_to_string(self.marker_path()) {
            Ok(text) => Ok(Some(SessionId::parse(text.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sessions that have a metadata log, oldest first
    pub fn logged_sessions(&self) -> Result<Vec<SessionId>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(session) = entry.file_name().to_str().and_then(parse_log_name) {
                sessions.push(session);
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

/// Cooperative stop request, honoured at the next checkpoint
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the running session to stop
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Work left for a directory once all of its children are done
enum DirFinish {
    /// Apply the source directory's attributes
    Attrs(FileRecord),
    /// Remove or replace the mirror directory
    Deferred(Box<Plan>),
}

struct OpenDir {
    index: Index,
    finish: DirFinish,
}

/// Running totals of one session
#[derive(Default)]
struct Tally {
    counts: ChangeCounts,
    skipped: Vec<SkippedEntry>,
    increments_written: usize,
}

impl Tally {
    fn skip(&mut self, index: Index, error: &RetraceError) {
        warn!("Skipping {}: {}", index, error);
        match error.class() {
            ErrorClass::TransientIo => self.counts.errored += 1,
            _ => self.counts.skipped += 1,
        }
        self.skipped.push(SkippedEntry {
            index,
            cause: error.to_string(),
        });
    }
}

/// A mirror directory with its backup data
pub struct Mirror {
    root: PathBuf,
    data: DataDir,
    config: RetraceConfig,
    transport: Arc<dyn Transport>,
    journal: Journal,
    increments: IncrementStore,
    stop: StopHandle,
    last_recovery: RecoveryReport,
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish()
    }
}

impl Mirror {
    /// Open (or create) a local mirror and run crash recovery
    ///
    /// # Errors
    ///
    /// - [`RetraceError::NotAMirror`] if `root` holds files but no `retrace-data`
    /// - [`RetraceError::InvalidConfiguration`] for a bad configuration
    pub fn open(root: &Path, config: RetraceConfig) -> Result<Self> {
        Self::open_with(root, config, Arc::new(LocalTransport::new()))
    }

    /// Open a mirror whose tree is reached through `transport`
    ///
    /// The backup-data directory is always accessed locally.
    #[instrument(skip(config, transport))]
    pub fn open_with(root: &Path, config: RetraceConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let data = DataDir::new(root);
        if root.exists() {
            let populated = fs::read_dir(root)?.next().is_some();
            if populated && !data.root().is_dir() {
                return Err(RetraceError::NotAMirror(root.to_path_buf()));
            }
        } else {
            info!("Creating mirror at {:?}", root);
            fs::create_dir_all(root)?;
        }
        fs::create_dir_all(data.root())?;

        let journal = Journal::open(data.journal_dir(), config.fsync)?;
        let increments = IncrementStore::open(data.increments_dir(), config.fsync)?;
        let mut mirror = Self {
            root: root.to_path_buf(),
            data,
            config,
            transport,
            journal,
            increments,
            stop: StopHandle::default(),
            last_recovery: RecoveryReport::default(),
        };
        mirror.last_recovery = mirror.recover()?;
        Ok(mirror)
    }

    /// Mirror directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings in effect
    pub fn config(&self) -> &RetraceConfig {
        &self.config
    }

    /// Backup-data directory layout
    pub fn data_dir(&self) -> &DataDir {
        &self.data
    }

    /// What the recovery run at open time did
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.last_recovery
    }

    /// Handle another thread can use to stop a running session
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Last finalized session
    pub fn current_session(&self) -> Result<Option<SessionId>> {
        self.data.current_session()
    }

    /// Finalized sessions, oldest first
    pub fn sessions(&self) -> Result<Vec<SessionId>> {
        let Some(current) = self.current_session()? else {
            return Ok(Vec::new());
        };
        Ok(self
            .data
            .logged_sessions()?
            .into_iter()
            .filter(|session| *session <= current)
            .collect())
    }

    /// Increments recorded for one path, oldest first
    pub fn increments_for(&self, index: &Index) -> Result<Vec<IncrementName>> {
        self.increments.list_for(index)
    }

    /// Every committed increment, in path order
    pub fn all_increments(&self) -> Result<Vec<IncrementName>> {
        self.increments.list_all()
    }

    /// Reader for earlier states of the mirror
    pub fn restorer(&self) -> Restorer<'_> {
        Restorer::new(
            self.transport.as_ref(),
            &self.root,
            &self.data,
            &self.increments,
        )
    }

    /// Resolve everything an interrupted run left behind
    ///
    /// Pending journal entries are completed or rolled back, metadata logs
    /// of sessions that never finalized are removed and stray temporaries
    /// are deleted. Running it twice is the same as running it once.
    #[instrument(skip(self))]
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let mut report = self.journal.recover(self.transport.as_ref())?;

        let current = self.current_session()?;
        for session in self.data.logged_sessions()? {
            if current.map_or(true, |current| session > current) {
                fs::remove_file(self.data.log_path(&session))?;
                warn!("Removed metadata log of unfinished session {}", session);
                report.logs_removed += 1;
            }
        }

        report.temps_removed += self.increments.remove_stray_temps()?;
        for entry in fs::read_dir(self.data.root())? {
            let entry = entry?;
            if entry.file_type()?.is_file() && is_temp_name(&entry.file_name()) {
                fs::remove_file(entry.path())?;
                report.temps_removed += 1;
            }
        }

        if report.is_clean() {
            debug!("Recovery found nothing to do");
        } else {
            info!("Recovery: {:?}", report);
        }
        Ok(report)
    }

    /// Back up a local directory
    pub fn backup_local(&mut self, source_root: impl AsRef<Path>) -> Result<SessionReport> {
        self.backup(Arc::new(LocalTransport::new()), source_root.as_ref(), None)
    }

    /// Back up the tree at `source_root`, reached through `source`
    ///
    /// Returns a report with `finalized == false` if a stop request ended the
    /// run early.
    ///
    /// # Errors
    ///
    /// Fatal errors abort the run. The session stays unfinalized and the
    /// next [`Mirror::recover`] discards it.
    #[instrument(skip(self, source, progress), fields(mirror = ?self.root))]
    pub fn backup(
        &mut self,
        source: Arc<dyn Transport>,
        source_root: &Path,
        mut progress: Option<&mut dyn FnMut(&ProgressInfo)>,
    ) -> Result<SessionReport> {
        let started = Instant::now();
        if !self.journal.is_empty()? {
            self.recover()?;
        }
        self.stop.clear();

        let previous = self.current_session()?;
        let session = SessionId::now_after(previous.as_ref());
        info!("Starting session {} (previous: {:?})", session, previous.map(|p| p.quoted()));

        let mut prior = match &previous {
            Some(prev) => PriorRecords::open(&self.data.log_path(prev)).unwrap_or_else(|e| {
                warn!("Previous metadata log unreadable, comparing against the mirror only: {}", e);
                PriorRecords::empty()
            }),
            None => PriorRecords::empty(),
        };
        let mut log = MetadataWriter::create(&self.data.log_path(&session), self.config.fsync)?;

        let mut walker = PairedWalker::new(
            source.clone(),
            source_root,
            self.transport.clone(),
            &self.root,
            self.config.selector()?,
            WalkOptions {
                relax_permissions: self.config.relax_permissions,
                xattrs: self.config.preserve_xattrs,
            },
        );
        let engine = DiffEngine::new(
            source.as_ref(),
            source_root,
            self.transport.as_ref(),
            &self.root,
            &self.config,
            previous.is_some(),
        );
        let writer = IncrementWriter::new(
            self.transport.as_ref(),
            &self.root,
            &self.journal,
            &self.increments,
            session,
            previous,
            self.config.attr_options(),
            self.config.fsync,
        );
        #[cfg(any(test, feature = "fail-points"))]
        let writer = writer.with_fail_point(self.config.fail_point);

        let roots = [source_root, self.root.as_path()];
        let mut tally = Tally::default();
        let mut open_dirs: Vec<OpenDir> = Vec::new();
        let mut processed = 0usize;
        let mut last_checkpoint = Instant::now();
        let mut stopped = false;

        while let Some(item) = walker.next() {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) if e.is_per_file() => {
                    let index = error_index(&e, &roots);
                    if !index.is_root() {
                        for record in prior.take_subtree(&index) {
                            log.append(&record)?;
                        }
                    }
                    tally.skip(index, &e);
                    continue;
                }
                Err(e) => {
                    self.repair_relaxed(walker.abandon(), source.as_ref());
                    return Err(e);
                }
            };

            while let Some(top) = open_dirs.last() {
                if top.index.is_ancestor_of(&entry.index) {
                    break;
                }
                if let Some(done) = open_dirs.pop() {
                    finish_dir(&writer, done, &mut tally)?;
                }
            }

            let entry = overlay_prior(entry, &mut prior);
            if let Some(cause) = &entry.listing_error {
                carry_forward(&entry, &mut prior, &mut log)?;
                tally.skip(entry.index.clone(), cause);
            } else if let Err(e) = self.process(&engine, &writer, &entry, &mut log, &mut tally, &mut open_dirs) {
                if e.is_fatal() {
                    self.repair_relaxed(walker.abandon(), source.as_ref());
                    return Err(e);
                }
                if let Some(mirror) = &entry.mirror {
                    log.append(mirror)?;
                }
                tally.skip(entry.index.clone(), &e);
            }

            processed += 1;
            if let Some(callback) = progress.as_mut() {
                callback(&ProgressInfo {
                    current: entry.index.clone(),
                    processed,
                    counts: tally.counts.clone(),
                });
            }

            if processed % self.config.checkpoint_every == 0
                || last_checkpoint.elapsed() >= self.config.checkpoint_interval
            {
                log.checkpoint()?;
                last_checkpoint = Instant::now();
                trace!("Checkpoint after {} entries", processed);
                if self.stop.is_stop_requested() {
                    info!("Stop requested; ending session {} unfinalized", session);
                    self.repair_relaxed(walker.abandon(), source.as_ref());
                    stopped = true;
                    break;
                }
            }
        }

        if !stopped {
            while let Some(done) = open_dirs.pop() {
                finish_dir(&writer, done, &mut tally)?;
            }
        }
        let records = log.finish()?;

        if !stopped {
            self.finalize(&session)?;
        }
        let finalized = !stopped;
        let report = SessionReport {
            session,
            previous,
            counts: tally.counts,
            skipped: tally.skipped,
            increments_written: tally.increments_written,
            corrupt_records: prior.corrupt_count(),
            finalized,
            duration: started.elapsed(),
        };
        info!(
            "Session {} {}: {} records, {} new, {} changed, {} deleted, {} skipped, {} errored",
            session,
            if finalized { "finalized" } else { "stopped" },
            records,
            report.counts.new,
            report.counts.changed,
            report.counts.deleted,
            report.counts.skipped,
            report.counts.errored
        );
        Ok(report)
    }

    fn process(
        &self,
        engine: &DiffEngine<'_>,
        writer: &IncrementWriter<'_>,
        entry: &PairedEntry,
        log: &mut MetadataWriter,
        tally: &mut Tally,
        open_dirs: &mut Vec<OpenDir>,
    ) -> Result<()> {
        let plan = engine.plan(entry)?;
        let mirror_is_dir = entry.mirror.as_ref().is_some_and(|m| m.attrs.is_dir());
        let source_is_dir = plan.source.as_ref().is_some_and(|s| s.attrs.is_dir());

        if mirror_is_dir && !source_is_dir {
            writer.make_writable(&entry.index.to_path(&self.root))?;
            trace!("Deferring {:?} of {} until its children are done", plan.action, plan.index);
            open_dirs.push(OpenDir {
                index: plan.index.clone(),
                finish: DirFinish::Deferred(Box::new(plan.clone())),
            });
        } else {
            let outcome = writer.apply(&plan)?;
            if outcome.increment.is_some() {
                tally.increments_written += 1;
            }
            if let Some(source) = plan.source.as_ref().filter(|_| source_is_dir) {
                writer.make_writable(&entry.index.to_path(&self.root))?;
                open_dirs.push(OpenDir {
                    index: plan.index.clone(),
                    finish: DirFinish::Attrs(source.clone()),
                });
            }
        }

        tally.counts.record(plan.action);
        if let Some(source) = &plan.source {
            log.append(source)?;
        }
        Ok(())
    }

    fn finalize(&self, session: &SessionId) -> Result<()> {
        if !self.journal.is_empty()? {
            return Err(RetraceError::durability(
                "journal still has pending entries at finalization",
            ));
        }
        atomic_write(
            &self.data.marker_path(),
            format!("{}\n", session.quoted()).as_bytes(),
            self.config.fsync,
        )
        .map_err(|e| RetraceError::durability(format!("cannot advance current_mirror: {}", e)))?;
        let config = serde_json::to_vec_pretty(&self.config)?;
        atomic_write(&self.data.config_path(), &config, self.config.fsync)?;
        debug!("Finalized session {}", session);
        Ok(())
    }

    fn repair_relaxed(&self, relaxed: Vec<RelaxedDir>, source: &dyn Transport) {
        for dir in relaxed.into_iter().rev() {
            let transport = match dir.side {
                Side::Source => source,
                Side::Mirror => self.transport.as_ref(),
            };
            if let Err(e) = transport.set_mode(&dir.path, dir.original_mode) {
                warn!("Could not restore mode {:o} on {:?}: {}", dir.original_mode, dir.path, e);
            }
        }
    }
}

fn finish_dir(writer: &IncrementWriter<'_>, dir: OpenDir, tally: &mut Tally) -> Result<()> {
    let result = match &dir.finish {
        DirFinish::Attrs(record) => writer.finish_dir(record),
        DirFinish::Deferred(plan) => writer.apply(plan).map(|outcome| {
            if outcome.increment.is_some() {
                tally.increments_written += 1;
            }
        }),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_per_file() => {
            tally.skip(dir.index, &e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Log an entry that could not be walked, and everything the previous
/// session logged below it, as the mirror still holds them
fn carry_forward(entry: &PairedEntry, prior: &mut PriorRecords, log: &mut MetadataWriter) -> Result<()> {
    let Some(mirror) = &entry.mirror else {
        return Ok(());
    };
    log.append(mirror)?;
    if mirror.attrs.is_dir() {
        let below = prior.take_subtree(&entry.index);
        debug!("Carrying {} records below {} forward", below.len(), entry.index);
        for record in &below {
            log.append(record)?;
        }
    }
    Ok(())
}

/// Prefer the previous session's record for the mirror side when the live
/// object still matches it, so logged attributes (ownership, fingerprint)
/// survive a mirror that cannot store them
fn overlay_prior(mut entry: PairedEntry, prior: &mut PriorRecords) -> PairedEntry {
    let Some(live) = entry.mirror.take() else {
        return entry;
    };
    let logged = prior.lookup(&entry.index);
    entry.mirror = Some(match logged {
        Some(logged) if logged.file_type() == live.file_type() => match (&live.attrs, &logged.attrs) {
            (
                FileAttrs::Regular { size: s1, mtime: m1, .. },
                FileAttrs::Regular { size: s2, mtime: m2, .. },
            ) if s1 == s2 && m1 == m2 => logged,
            (FileAttrs::Regular { .. }, _) => live,
            (FileAttrs::Symlink { target: t1, .. }, FileAttrs::Symlink { target: t2, .. }) if t1 != t2 => live,
            _ => logged,
        },
        _ => live,
    });
    entry
}

/// Best-effort index of the entry an error is about
fn error_index(error: &RetraceError, roots: &[&Path]) -> Index {
    let path = match error {
        RetraceError::TransientIo { path, .. }
        | RetraceError::PermissionDenied { path }
        | RetraceError::UnsupportedFileType { path } => path,
        _ => return Index::root(),
    };
    roots
        .iter()
        .find_map(|root| path.strip_prefix(root).ok())
        .map(Index::from_relative)
        .unwrap_or_else(Index::root)
}
