//! Run configuration
//!
//! [`RetraceConfig`] is an explicit, immutable value passed into every entry
//! point. It is assembled with [`RetraceBuilder`] and persisted next to the
//! mirror (`retrace-data/config.json`) after each finalized session so that
//! the settings of the last run can be inspected.
//!
//! # Example
//!
//! ```rust,no_run
//! use retrace::RetraceBuilder;
//! use std::time::Duration;
//!
//! # fn main() -> retrace::Result<()> {
//! let mirror = RetraceBuilder::new()
//!     .exclude("**/*.tmp")
//!     .delta_size_ratio(0.75)
//!     .checkpoint_interval(Duration::from_secs(10))
//!     .open("/backups/home")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Default Values
//!
//! - `rules`: empty (everything is selected)
//! - `delta_size_ratio`: 0.9
//! - `block_size`: chosen per file from its size
//! - `checkpoint_every`: 1000 entries
//! - `checkpoint_interval`: 20 seconds
//! - `relax_permissions`: true
//! - `preserve_ownership`: false
//! - `preserve_xattrs`: false
//! - `fsync`: true

use crate::error::{Result, RetraceError};
use crate::fsutil::AttrOptions;
use crate::mirror::Mirror;
use crate::selection::{SelectionRule, Selector};
#[cfg(any(test, feature = "fail-points"))]
use crate::writer::FailPoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default ratio of encoded delta size to full size above which a snapshot is stored
pub const DEFAULT_DELTA_SIZE_RATIO: f64 = 0.9;

/// Default number of entries between checkpoints
pub const DEFAULT_CHECKPOINT_EVERY: usize = 1000;

/// Default time between checkpoints
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(20);

/// Immutable settings for a mirroring session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetraceConfig {
    /// Selection rules, evaluated last-match-wins
    pub rules: Vec<SelectionRule>,
    /// Store a snapshot instead of a delta when the delta is larger than
    /// this fraction of the full content
    pub delta_size_ratio: f64,
    /// Fixed signature block size; `None` picks one per file
    pub block_size: Option<usize>,
    /// Entries between checkpoints
    pub checkpoint_every: usize,
    /// Time between checkpoints
    pub checkpoint_interval: Duration,
    /// Temporarily relax permissions of unreadable or unwritable directories
    pub relax_permissions: bool,
    /// Apply uid/gid to the mirror
    pub preserve_ownership: bool,
    /// Record and apply extended attributes
    pub preserve_xattrs: bool,
    /// Fsync artifacts, journal entries and the metadata log
    pub fsync: bool,
    /// Crash injection for tests; never persisted
    #[cfg(any(test, feature = "fail-points"))]
    #[serde(skip)]
    pub fail_point: Option<FailPoint>,
}

impl Default for RetraceConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            delta_size_ratio: DEFAULT_DELTA_SIZE_RATIO,
            block_size: None,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            relax_permissions: true,
            preserve_ownership: false,
            preserve_xattrs: false,
            fsync: true,
            #[cfg(any(test, feature = "fail-points"))]
            fail_point: None,
        }
    }
}

impl RetraceConfig {
    /// Check value ranges and compile the selection rules once
    ///
    /// # Errors
    ///
    /// - [`RetraceError::InvalidConfiguration`] for out-of-range values
    /// - [`RetraceError::InvalidPattern`] for rules that do not compile
    pub fn validate(&self) -> Result<()> {
        if !self.delta_size_ratio.is_finite() || self.delta_size_ratio <= 0.0 {
            return Err(RetraceError::InvalidConfiguration(format!(
                "delta_size_ratio must be a positive number, got {}",
                self.delta_size_ratio
            )));
        }
        if self.block_size == Some(0) {
            return Err(RetraceError::InvalidConfiguration(
                "block_size must be at least 1".to_string(),
            ));
        }
        if self.checkpoint_every == 0 {
            return Err(RetraceError::InvalidConfiguration(
                "checkpoint_every must be at least 1".to_string(),
            ));
        }
        self.selector().map(|_| ())
    }

    /// Compile the selection rules
    pub fn selector(&self) -> Result<Selector> {
        Selector::new(&self.rules)
    }

    /// Optional attributes the mirror side reads and applies
    pub fn attr_options(&self) -> AttrOptions {
        AttrOptions {
            ownership: self.preserve_ownership,
            xattrs: self.preserve_xattrs,
        }
    }
}

/// Builder for [`RetraceConfig`] and [`Mirror`]
#[derive(Debug, Default)]
pub struct RetraceBuilder {
    config: RetraceConfig,
}

impl RetraceBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an include rule
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.config.rules.push(SelectionRule::include(pattern));
        self
    }

    /// Append an exclude rule
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.config.rules.push(SelectionRule::exclude(pattern));
        self
    }

    /// Replace all selection rules
    pub fn rules(mut self, rules: Vec<SelectionRule>) -> Self {
        self.config.rules = rules;
        self
    }

    /// Set the delta/snapshot threshold
    ///
    /// A reverse delta whose encoded size exceeds `ratio` times the full
    /// content size is replaced by a snapshot increment.
    pub fn delta_size_ratio(mut self, ratio: f64) -> Self {
        self.config.delta_size_ratio = ratio;
        self
    }

    /// Force a fixed signature block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = Some(size);
        self
    }

    /// Checkpoint after this many entries (minimum 1)
    pub fn checkpoint_every(mut self, entries: usize) -> Self {
        self.config.checkpoint_every = entries.max(1);
        self
    }

    /// Checkpoint after this much time
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    /// Allow relaxing directory permissions while walking
    pub fn relax_permissions(mut self, relax: bool) -> Self {
        self.config.relax_permissions = relax;
        self
    }

    /// Apply uid/gid to the mirror
    pub fn preserve_ownership(mut self, preserve: bool) -> Self {
        self.config.preserve_ownership = preserve;
        self
    }

    /// Record and apply extended attributes
    pub fn preserve_xattrs(mut self, preserve: bool) -> Self {
        self.config.preserve_xattrs = preserve;
        self
    }

    /// Enable or disable fsync (disable only for throwaway mirrors)
    pub fn fsync(mut self, fsync: bool) -> Self {
        self.config.fsync = fsync;
        self
    }

    /// Abort the first journaled mutation at `point`
    #[cfg(any(test, feature = "fail-points"))]
    pub fn fail_point(mut self, point: FailPoint) -> Self {
        self.config.fail_point = Some(point);
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<RetraceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Validate the configuration and open (or create) a mirror at `mirror_root`
    ///
    /// Opening runs crash recovery before anything else.
    pub fn open(self, mirror_root: impl AsRef<Path>) -> Result<Mirror> {
        let config = self.build()?;
        Mirror::open(mirror_root.as_ref(), config)
    }
}
