//! # Retrace CLI - Reversible mirrors of directory trees
//!
//! A thin command-line interface over the Retrace library.
//!
//! ## Usage
//! ```bash
//! # Mirror a directory (the first run is a plain copy)
//! retrace backup ~/project /backups/project --exclude '**/target'
//!
//! # List finalized sessions
//! retrace list /backups/project
//!
//! # Rebuild the tree as it was at a session (a unique prefix is enough)
//! retrace restore /backups/project --at 20240102 --to /tmp/project-old
//!
//! # Resolve an interrupted run
//! retrace recover /backups/project
//! ```
//!
//! Exit codes: 0 clean, 2 completed with skipped files, 1 aborted.

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use retrace::fsutil::format_bytes;
use retrace::{
    Index, LocalTransport, Mirror, Result, RetraceBuilder, RetraceError, RunStatus, SessionId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Retrace CLI - incremental, reversible mirroring
#[derive(Parser)]
#[command(name = "retrace")]
#[command(version)]
#[command(about = "Mirror a directory tree and keep reverse increments of every change")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update a mirror from a source tree
    Backup {
        /// Directory to back up
        source: PathBuf,

        /// Mirror directory (created if missing)
        mirror: PathBuf,

        /// Include pattern (glob, relative to the source root)
        #[arg(short, long)]
        include: Vec<String>,

        /// Exclude pattern (glob, relative to the source root)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Store a snapshot when a delta exceeds this fraction of the file
        #[arg(long)]
        delta_ratio: Option<f64>,

        /// Apply ownership to the mirror
        #[arg(long)]
        preserve_ownership: bool,

        /// Record and apply extended attributes
        #[arg(long)]
        preserve_xattrs: bool,

        /// Skip fsync calls (faster, not crash safe)
        #[arg(long)]
        no_fsync: bool,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Rebuild an earlier state
    #[command(alias = "rs")]
    Restore {
        /// Mirror directory
        mirror: PathBuf,

        /// Session id, a unique prefix of one, or "latest"
        #[arg(long, default_value = "latest")]
        at: String,

        /// Restore only this path (relative to the tree root)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Destination file or directory
        #[arg(long)]
        to: PathBuf,
    },

    /// List finalized sessions
    #[command(alias = "ls")]
    List {
        /// Mirror directory
        mirror: PathBuf,

        /// Also list the increments of this path
        #[arg(long)]
        increments: Option<PathBuf>,
    },

    /// Resolve whatever an interrupted run left behind
    Recover {
        /// Mirror directory
        mirror: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(status) => std::process::exit(status.exit_code()),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            std::process::exit(RunStatus::Aborted.exit_code());
        }
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<RunStatus> {
    match cli.command {
        Commands::Backup {
            source,
            mirror,
            include,
            exclude,
            delta_ratio,
            preserve_ownership,
            preserve_xattrs,
            no_fsync,
            progress,
        } => {
            let mut builder = RetraceBuilder::new()
                .preserve_ownership(preserve_ownership)
                .preserve_xattrs(preserve_xattrs)
                .fsync(!no_fsync);
            for pattern in include {
                builder = builder.include(pattern);
            }
            for pattern in exclude {
                builder = builder.exclude(pattern);
            }
            if let Some(ratio) = delta_ratio {
                builder = builder.delta_size_ratio(ratio);
            }
            cmd_backup(builder, &source, &mirror, progress)
        }
        Commands::Restore {
            mirror,
            at,
            path,
            to,
        } => cmd_restore(&mirror, &at, path.as_deref(), &to),
        Commands::List { mirror, increments } => cmd_list(&mirror, increments.as_deref()),
        Commands::Recover { mirror } => cmd_recover(&mirror),
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message.to_string());
    pb
}

/// Open an existing mirror without creating one
fn open_existing(mirror: &Path) -> Result<Mirror> {
    if !mirror.join(retrace::walker::DATA_DIR_NAME).is_dir() {
        return Err(RetraceError::NotAMirror(mirror.to_path_buf()));
    }
    RetraceBuilder::new().open(mirror)
}

/// Run one backup session
///
/// Recovery runs first if a previous run was interrupted. The report lists
/// every skipped path with its cause.
fn cmd_backup(builder: RetraceBuilder, source: &Path, mirror: &Path, show_progress: bool) -> Result<RunStatus> {
    let mut target = builder.open(mirror)?;
    let recovery = target.last_recovery();
    if !recovery.is_clean() {
        println!(
            "{} Recovered from an interrupted run: {} completed, {} rolled back",
            "!".yellow().bold(),
            recovery.completed,
            recovery.rolled_back
        );
    }

    println!("{}", "Backing up...".blue().bold());
    let pb = show_progress.then(|| spinner("Scanning..."));
    let mut on_progress = |info: &retrace::ProgressInfo| {
        if let Some(pb) = &pb {
            pb.set_message(format!("{} entries, at {}", info.processed, info.current));
        }
    };
    let report = target.backup(
        Arc::new(LocalTransport::new()),
        source,
        Some(&mut on_progress),
    )?;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    let status = report.status();
    let mark = match status {
        RunStatus::Clean => "✓".green().bold(),
        RunStatus::CompletedWithSkips => "!".yellow().bold(),
        RunStatus::Aborted => "✗".red().bold(),
    };
    println!("{} Session {}", mark, report.session.to_string().yellow().bold());
    if let Some(previous) = &report.previous {
        println!("  Previous: {}", previous.to_string().dimmed());
    }
    println!("  New: {}", report.counts.new.to_string().cyan());
    println!("  Changed: {}", report.counts.changed.to_string().cyan());
    println!("  Attributes only: {}", report.counts.metadata_only.to_string().cyan());
    println!("  Deleted: {}", report.counts.deleted.to_string().cyan());
    println!("  Unchanged: {}", report.counts.unchanged.to_string().dimmed());
    println!("  Increments: {}", report.increments_written.to_string().cyan());
    println!("  Time: {}", format_duration(report.duration).to_string().cyan());

    if !report.skipped.is_empty() {
        println!("\n{}", "Skipped:".yellow().bold());
        for skipped in &report.skipped {
            println!("  - {}: {}", skipped.index, skipped.cause.yellow());
        }
    }
    if !report.finalized {
        println!("{}", "Session stopped before finalizing".red());
    }
    Ok(status)
}

/// Resolve a session argument: "latest", an exact id or a unique prefix
fn resolve_session(mirror: &Mirror, at: &str) -> Result<SessionId> {
    let sessions = mirror.sessions()?;
    if at == "latest" {
        return sessions
            .last()
            .copied()
            .ok_or_else(|| RetraceError::SessionNotFound(at.to_string()));
    }
    let matches: Vec<_> = sessions
        .iter()
        .filter(|session| session.quoted().starts_with(at))
        .collect();
    match matches.as_slice() {
        [only] => Ok(**only),
        _ => Err(RetraceError::SessionNotFound(at.to_string())),
    }
}

/// Rebuild a file or the whole tree as of a session
fn cmd_restore(mirror: &Path, at: &str, path: Option<&Path>, to: &Path) -> Result<RunStatus> {
    let source = open_existing(mirror)?;
    let session = resolve_session(&source, at)?;
    println!(
        "{} {}",
        "Restoring session".blue().bold(),
        session.to_string().yellow()
    );
    let restorer = source.restorer();

    match path {
        Some(path) => {
            let restored = restorer.restore_file(&Index::from_relative(path), &session)?;
            let content = restored
                .content
                .ok_or_else(|| RetraceError::UnsupportedFileType { path: path.to_path_buf() })?;
            std::fs::write(to, &content)?;
            println!("{} Restored {} ({})", "✓".green().bold(), path.display(), format_bytes(content.len() as u64));
            Ok(RunStatus::Clean)
        }
        None => {
            let pb = spinner("Restoring files...");
            let summary = restorer.restore_tree(&session, to)?;
            pb.finish_and_clear();
            println!("{} Restoration complete", "✓".green().bold());
            println!("  Files: {}", summary.files.to_string().cyan());
            println!("  Directories: {}", summary.directories.to_string().cyan());
            println!("  Bytes written: {}", format_bytes(summary.bytes).cyan());
            if summary.skipped > 0 {
                println!("  Skipped: {}", summary.skipped.to_string().yellow());
                return Ok(RunStatus::CompletedWithSkips);
            }
            Ok(RunStatus::Clean)
        }
    }
}

/// List finalized sessions, newest marked with `*`
fn cmd_list(mirror: &Path, increments: Option<&Path>) -> Result<RunStatus> {
    let target = open_existing(mirror)?;
    let sessions = target.sessions()?;
    if sessions.is_empty() {
        println!("{}", "No sessions found.".yellow());
        return Ok(RunStatus::Clean);
    }

    let current = target.current_session()?;
    println!("{}", "Sessions:".blue().bold());
    for session in &sessions {
        let marker = if Some(*session) == current {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!(
            "{} {} {}",
            marker,
            session.to_string().yellow(),
            session.as_datetime().format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }

    if let Some(path) = increments {
        let index = Index::from_relative(path);
        println!("\n{} {}", "Increments of".blue().bold(), index);
        for name in target.increments_for(&index)? {
            println!("  {} {}", name.time.to_string().yellow(), name.action.tag().cyan());
        }
    }
    Ok(RunStatus::Clean)
}

/// Run crash recovery and report what it did
fn cmd_recover(mirror: &Path) -> Result<RunStatus> {
    let target = open_existing(mirror)?;
    let report = target.last_recovery();
    if report.is_clean() {
        println!("{} Nothing to recover", "✓".green().bold());
    } else {
        println!("{} Recovery complete", "✓".green().bold());
        println!("  Completed: {}", report.completed.to_string().cyan());
        println!("  Rolled back: {}", report.rolled_back.to_string().yellow());
        println!("  Unfinished logs removed: {}", report.logs_removed.to_string().cyan());
        println!("  Temporary files removed: {}", report.temps_removed.to_string().cyan());
    }
    Ok(RunStatus::Clean)
}
