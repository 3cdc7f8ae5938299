//! Integration tests for multi-session scenarios
//!
//! Each test drives several sessions against real directories and checks the
//! mirror, the increments it left and what can be restored from them.

use ::retrace::increment::IncrementAction;
use ::retrace::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Test environment with a source tree and a mirror
pub struct TestEnvironment {
    pub source: TempDir,
    pub target: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            source: TempDir::new().unwrap(),
            target: TempDir::new().unwrap(),
        }
    }

    pub fn src(&self) -> &Path {
        self.source.path()
    }

    pub fn dst(&self) -> &Path {
        self.target.path()
    }

    pub fn open(&self) -> Mirror {
        RetraceBuilder::new().fsync(false).open(self.dst()).unwrap()
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.src().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}

/// Regular files under `root` and their contents, ignoring the data directory
pub fn snapshot_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != "retrace-data")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect()
}

#[test]
fn test_paired_walk_order_and_outcome() {
    let env = TestEnvironment::new();
    env.write("a", "a");
    env.write("b/c", "c");
    env.write("e", "e");
    let mut mirror = env.open();
    let first = mirror.backup_local(env.src()).unwrap().session;

    fs::remove_file(env.src().join("e")).unwrap();
    env.write("d", "d");

    let mut visited = Vec::new();
    let mut record_order = |info: &ProgressInfo| visited.push(info.current.clone());
    let report = mirror
        .backup(
            std::sync::Arc::new(LocalTransport::new()),
            env.src(),
            Some(&mut record_order),
        )
        .unwrap();

    assert_eq!(
        visited,
        vec![
            Index::root(),
            Index::from_components(["a"]),
            Index::from_components(["b"]),
            Index::from_components(["b", "c"]),
            Index::from_components(["d"]),
            Index::from_components(["e"]),
        ]
    );
    assert_eq!(report.counts.new, 1);
    assert_eq!(report.counts.deleted, 1);

    let d = mirror.increments_for(&Index::from_components(["d"])).unwrap();
    assert_eq!(d.len(), 1);
    assert_eq!(d[0].action, IncrementAction::Missing);
    let e = mirror.increments_for(&Index::from_components(["e"])).unwrap();
    assert_eq!(e.len(), 1);
    assert_eq!(e[0].action, IncrementAction::Snapshot);
    assert_eq!(e[0].time, first);

    // The first state comes back intact
    let out = TempDir::new().unwrap();
    mirror.restorer().restore_tree(&first, out.path()).unwrap();
    let tree = snapshot_tree(out.path());
    let names: Vec<_> = tree.keys().cloned().collect();
    assert_eq!(
        names,
        vec![PathBuf::from("a"), PathBuf::from("b/c"), PathBuf::from("e")]
    );
}

#[test]
fn test_many_sessions_restore_each_state() {
    let env = TestEnvironment::new();
    let mut mirror = env.open();
    let mut history = Vec::new();

    // Each session grows one file and rewrites another
    for round in 0..5 {
        env.write("grows.txt", &"line\n".repeat(round + 1));
        env.write("rewritten.txt", &format!("version {}{}", round, "!".repeat(round)));
        if round % 2 == 0 {
            env.write(&format!("dir{}/note.txt", round), "note");
        }
        let report = mirror.backup_local(env.src()).unwrap();
        assert_eq!(report.status(), RunStatus::Clean);
        history.push((report.session, snapshot_tree(env.src())));
    }

    assert_eq!(mirror.sessions().unwrap().len(), 5);
    for (session, expected) in &history {
        let out = TempDir::new().unwrap();
        let summary = mirror.restorer().restore_tree(session, out.path()).unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(&snapshot_tree(out.path()), expected);
    }
}

#[test]
fn test_large_file_uses_reverse_delta() {
    let env = TestEnvironment::new();
    let big: String = (0..4000).map(|i| format!("record {:05}\n", i)).collect();
    env.write("big.txt", &big);
    let mut mirror = env.open();
    let first = mirror.backup_local(env.src()).unwrap().session;

    // Insert a line in the middle; most blocks still match
    let edited = big.replacen("record 02000\n", "record 02000\ninserted\n", 1);
    env.write("big.txt", &edited);
    mirror.backup_local(env.src()).unwrap();

    let index = Index::from_components(["big.txt"]);
    let increments = mirror.increments_for(&index).unwrap();
    assert_eq!(increments.len(), 1);
    assert_eq!(increments[0].action, IncrementAction::Diff);

    let restored = mirror.restorer().restore_file(&index, &first).unwrap();
    assert_eq!(restored.content.unwrap(), big.as_bytes());
}

#[test]
fn test_selection_rules() {
    let env = TestEnvironment::new();
    env.write("keep.txt", "keep");
    env.write("debug.log", "log");
    env.write("logs/important.log", "important");
    env.write("logs/other.log", "other");

    let mut mirror = RetraceBuilder::new()
        .include("**")
        .exclude("**/*.log")
        .include("/logs/important.log")
        .fsync(false)
        .open(env.dst())
        .unwrap();
    mirror.backup_local(env.src()).unwrap();

    assert!(env.dst().join("keep.txt").exists());
    assert!(!env.dst().join("debug.log").exists());
    assert!(env.dst().join("logs/important.log").exists());
    assert!(!env.dst().join("logs/other.log").exists());
}

#[test]
fn test_newly_excluded_file_is_deleted_with_increment() {
    let env = TestEnvironment::new();
    env.write("a.txt", "a");
    env.write("b.tmp", "scratch");
    let mut mirror = env.open();
    let first = mirror.backup_local(env.src()).unwrap().session;
    drop(mirror);

    let mut mirror = RetraceBuilder::new()
        .exclude("*.tmp")
        .fsync(false)
        .open(env.dst())
        .unwrap();
    let report = mirror.backup_local(env.src()).unwrap();
    assert_eq!(report.counts.deleted, 1);
    assert!(!env.dst().join("b.tmp").exists());

    let restored = mirror
        .restorer()
        .restore_file(&Index::from_components(["b.tmp"]), &first)
        .unwrap();
    assert_eq!(restored.content.unwrap(), b"scratch");
}

#[test]
fn test_directory_and_file_swap_places() {
    let env = TestEnvironment::new();
    env.write("thing/inner.txt", "inner");
    env.write("other", "plain file");
    let mut mirror = env.open();
    let first = mirror.backup_local(env.src()).unwrap().session;
    let before = snapshot_tree(env.src());

    fs::remove_dir_all(env.src().join("thing")).unwrap();
    fs::remove_file(env.src().join("other")).unwrap();
    env.write("thing", "now a file");
    env.write("other/child.txt", "now a dir");
    let report = mirror.backup_local(env.src()).unwrap();
    assert_eq!(report.status(), RunStatus::Clean);
    assert_eq!(snapshot_tree(env.dst()), snapshot_tree(env.src()));

    let out = TempDir::new().unwrap();
    mirror.restorer().restore_tree(&first, out.path()).unwrap();
    assert_eq!(snapshot_tree(out.path()), before);
}

#[cfg(unix)]
#[test]
fn test_unreadable_file_is_skipped() {
    use std::os::unix::fs::PermissionsExt;

    // Root can read anything; the skip cannot be provoked
    if is_root() {
        return;
    }

    let env = TestEnvironment::new();
    env.write("ok.txt", "fine");
    env.write("secret.txt", "hidden");
    let secret = env.src().join("secret.txt");
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();

    let mut mirror = env.open();
    let report = mirror.backup_local(env.src()).unwrap();
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o644)).unwrap();

    assert!(report.finalized);
    assert_eq!(report.status(), RunStatus::CompletedWithSkips);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].index, Index::from_components(["secret.txt"]));
    assert!(env.dst().join("ok.txt").exists());
    assert!(!env.dst().join("secret.txt").exists());
}

#[cfg(unix)]
fn is_root() -> bool {
    use std::os::unix::fs::MetadataExt;
    fs::metadata("/proc/self").map(|m| m.uid() == 0).unwrap_or(false)
}
