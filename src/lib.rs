//! # Retrace - Incremental, reversible mirroring
//!
//! Retrace keeps a mirror of a directory tree up to date and, on every run,
//! writes enough reverse information ("increments") to rebuild any earlier
//! state of the tree. A run can be killed at any point without corrupting the
//! mirror or its history.
//!
//! ## Overview
//!
//! Each run is a *session* named by a UTC timestamp. A session:
//!
//! - walks the source tree and the mirror side by side
//! - classifies every path as new, changed, attribute-only, deleted or unchanged
//! - updates the mirror, storing a reverse delta or a snapshot of what it replaced
//! - appends a record of every path to the session's metadata log
//! - finalizes by atomically advancing the `current_mirror` marker
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use retrace::RetraceBuilder;
//! use retrace::record::Index;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut mirror = RetraceBuilder::new()
//!     .exclude("**/*.tmp")
//!     .open("./backup")?;
//!
//! // First session: a plain copy
//! let first = mirror.backup_local("./project")?;
//!
//! // Later sessions store reverse increments against the previous one
//! let second = mirror.backup_local("./project")?;
//! println!("{} changed since {}", second.counts.changed, first.session);
//!
//! // Read a file as it was in the first session
//! let old = mirror
//!     .restorer()
//!     .restore_file(&Index::from_components(["README.md"]), &first.session)?;
//! println!("{} bytes", old.content.map_or(0, |c| c.len()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! PairedWalker ──► DiffEngine ──► IncrementWriter ──► MetadataWriter
//!                                      │
//!                                   Journal
//! ```
//!
//! - **Paired walk** ([`walker`]): one merged, byte-ordered, pre-order walk
//!   of both trees, with selection rules applied to the source side.
//! - **Classification** ([`diff`]): size/mtime shortcuts, then SHA-256
//!   fingerprints; rsync-style deltas ([`delta`]) in both directions.
//! - **Increments** ([`increment`], [`writer`]): artifacts are written to a
//!   temporary name, fsynced and renamed; increments are never overwritten.
//! - **Journal** ([`journal`]): a durable entry brackets each mutation so
//!   recovery can tell a landed update from a half-done one.
//! - **Metadata log** ([`metadata`]): one escaped, tab-separated record per
//!   path per session.
//! - **Transport** ([`transport`]): every filesystem operation on either
//!   side is an enumerated request, optionally checked by an access policy.
//!
//! ## Crash Safety
//!
//! Opening a mirror runs recovery ([`Mirror::recover`]): pending journal
//! entries are completed or rolled back, metadata logs of sessions that never
//! finalized are removed and stray temporary files are deleted. Recovery
//! never replays a delta and is idempotent.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, RetraceError>`](RetraceError). Errors
//! about a single path (I/O while reading, permissions, unsupported file
//! types, corrupt records) are downgraded to a skip with a recorded cause;
//! anything that threatens the journal or the metadata log aborts the run.
//! [`RunStatus`] maps the outcome onto exit codes 0, 2 and 1.
//!
//! ## Module Organization
//!
//! - [`mirror`]: sessions, recovery, the on-disk layout
//! - [`config`]: configuration and builder
//! - [`restore`]: rebuilding earlier states
//! - [`record`] and [`fsutil`]: file records and the stat helper
//! - [`types`]: session ids, counters and reports
//! - [`error`]: error types and handling

// Public API modules
pub mod config;
pub mod delta;
pub mod diff;
pub mod error;
pub mod fsutil;
pub mod increment;
pub mod journal;
pub mod metadata;
pub mod mirror;
pub mod record;
pub mod restore;
pub mod selection;
pub mod transport;
pub mod types;
pub mod walker;
pub mod writer;

// Re-export main types for convenience
pub use config::{RetraceBuilder, RetraceConfig};
pub use error::{Result, RetraceError};
pub use mirror::{Mirror, StopHandle};
pub use record::{FileAttrs, FileRecord, Index};
pub use restore::{RestoredFile, Restorer};
pub use selection::{SelectionRule, Selector};
pub use transport::{AccessPolicy, GuardedTransport, LocalTransport, RestrictedPolicy, Transport};
pub use types::*;

#[cfg(test)]
mod tests;
