//! Core data types shared across the Retrace library
//!
//! ## Overview
//!
//! - **Sessions**: [`SessionId`], the UTC timestamp that names a backup run
//! - **Outcomes**: [`Action`], [`ChangeCounts`], [`SessionReport`], [`RunStatus`]
//! - **Recovery**: [`RecoveryReport`]
//! - **Progress**: [`ProgressInfo`], handed to progress callbacks during a run
//!
//! ## Examples
//!
//! ```rust
//! use retrace::types::{ChangeCounts, RunStatus};
//!
//! let counts = ChangeCounts { new: 3, skipped: 1, ..Default::default() };
//! assert_eq!(RunStatus::from_counts(&counts), RunStatus::CompletedWithSkips);
//! assert_eq!(RunStatus::CompletedWithSkips.exit_code(), 2);
//! ```

use crate::error::{Result, RetraceError};
use crate::record::Index;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Timestamp format of a quoted session id (no `:` and no `.`)
const SESSION_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";

/// Identifier of one backup session: a UTC timestamp with microsecond precision
///
/// The quoted form (`20240102T030405000006Z`) is filesystem safe and is used
/// in metadata log names and increment names. It contains no `.` so increment
/// names can be split from the right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(DateTime<Utc>);

impl SessionId {
    /// Session id for the current instant
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Session id for the current instant, strictly after `previous`
    ///
    /// Clock skew or two runs inside one microsecond would otherwise produce
    /// colliding or reordered session ids.
    pub fn now_after(previous: Option<&SessionId>) -> Self {
        let now = Self::now();
        match previous {
            Some(prev) if now <= *prev => SessionId(prev.0 + chrono::Duration::microseconds(1)),
            _ => now,
        }
    }

    /// Truncate a timestamp to microseconds and wrap it
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let micros = time.timestamp_micros();
        SessionId(Utc.timestamp_micros(micros).single().unwrap_or(time))
    }

    /// Underlying timestamp
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Filesystem-safe quoted form
    pub fn quoted(&self) -> String {
        self.0.format(SESSION_FORMAT).to_string()
    }

    /// Parse the quoted form
    ///
    /// # Errors
    ///
    /// - [`RetraceError::SessionNotFound`] if `quoted` is not a session id
    pub fn parse(quoted: &str) -> Result<Self> {
        NaiveDateTime::parse_from_str(quoted, SESSION_FORMAT)
            .map(|naive| SessionId(naive.and_utc()))
            .map_err(|_| RetraceError::SessionNotFound(quoted.to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.quoted())
    }
}

/// What the diff engine decided for one paired entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Present in the source only
    New,
    /// Content or type differs
    Diff,
    /// Same content, different attributes
    MetadataOnly,
    /// Present in the mirror only
    Deleted,
    /// Identical on both sides
    Unchanged,
}

/// Per-action counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    /// Entries created in the mirror
    pub new: usize,
    /// Entries whose content or type changed
    pub changed: usize,
    /// Entries whose attributes alone changed
    pub metadata_only: usize,
    /// Entries removed from the mirror
    pub deleted: usize,
    /// Entries left alone
    pub unchanged: usize,
    /// Entries skipped for permission or type reasons
    pub skipped: usize,
    /// Entries skipped after an I/O failure
    pub errored: usize,
}

impl ChangeCounts {
    /// Count one decided action
    pub fn record(&mut self, action: Action) {
        match action {
            Action::New => self.new += 1,
            Action::Diff => self.changed += 1,
            Action::MetadataOnly => self.metadata_only += 1,
            Action::Deleted => self.deleted += 1,
            Action::Unchanged => self.unchanged += 1,
        }
    }

    /// Whether the run touched the mirror at all
    pub fn has_changes(&self) -> bool {
        self.new + self.changed + self.metadata_only + self.deleted > 0
    }

    /// Total number of entries visited
    pub fn total(&self) -> usize {
        self.new
            + self.changed
            + self.metadata_only
            + self.deleted
            + self.unchanged
            + self.skipped
            + self.errored
    }
}

/// One entry the pipeline gave up on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedEntry {
    /// Where in the tree
    pub index: Index,
    /// Rendered cause
    pub cause: String,
}

/// How a run ended, mapped onto process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every entry was processed
    Clean,
    /// The run finished but skipped some entries
    CompletedWithSkips,
    /// The run did not finalize
    Aborted,
}

impl RunStatus {
    /// Status implied by a finished run's counters
    pub fn from_counts(counts: &ChangeCounts) -> Self {
        if counts.skipped + counts.errored > 0 {
            RunStatus::CompletedWithSkips
        } else {
            RunStatus::Clean
        }
    }

    /// Process exit code: 0 clean, 2 completed with skips, 1 aborted
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Clean => 0,
            RunStatus::CompletedWithSkips => 2,
            RunStatus::Aborted => 1,
        }
    }
}

/// Result of one backup session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session that ran
    pub session: SessionId,
    /// Session it superseded, if any
    pub previous: Option<SessionId>,
    /// Per-action counters
    pub counts: ChangeCounts,
    /// Entries that were skipped, with causes
    pub skipped: Vec<SkippedEntry>,
    /// Increments committed during the run
    pub increments_written: usize,
    /// Metadata records that failed to parse while reading the previous log
    pub corrupt_records: usize,
    /// Whether the session was finalized (marker advanced)
    pub finalized: bool,
    /// Wall-clock duration
    pub duration: Duration,
}

impl SessionReport {
    /// Exit status of this run
    pub fn status(&self) -> RunStatus {
        if !self.finalized {
            RunStatus::Aborted
        } else {
            RunStatus::from_counts(&self.counts)
        }
    }
}

/// What crash recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Journal entries whose mutation had fully landed
    pub completed: usize,
    /// Journal entries that were rolled back
    pub rolled_back: usize,
    /// Metadata logs of sessions that never finalized
    pub logs_removed: usize,
    /// Stray temporary files removed
    pub temps_removed: usize,
}

impl RecoveryReport {
    /// Whether recovery found nothing to do
    pub fn is_clean(&self) -> bool {
        *self == RecoveryReport::default()
    }
}

/// Progress information handed to callbacks during a run
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Entry currently being processed
    pub current: Index,
    /// Entries processed so far
    pub processed: usize,
    /// Counters so far
    pub counts: ChangeCounts,
}
