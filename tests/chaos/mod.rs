//! Chaos testing for Retrace
//!
//! Sessions are killed at injected fail points and the mirror is damaged in
//! the ways a crash leaves it. After recovery the mirror must hold the last
//! finalized state, a rerun must converge on the source and every earlier
//! state must still restore.

use ::retrace::writer::FailPoint;
use ::retrace::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;
use tracing_test::traced_test;
use walkdir::WalkDir;

const FAIL_POINTS: [FailPoint; 3] = [
    FailPoint::AfterJournalBegin,
    FailPoint::AfterIncrementCommit,
    FailPoint::BeforeJournalCommit,
];

/// Random source trees and edits, reproducible from a seed
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn content(&mut self) -> Vec<u8> {
        let len = self.rng.random_range(0..4096);
        (0..len).map(|_| self.rng.random::<u8>()).collect()
    }

    /// Populate `root` with a few directories of random files
    pub fn populate(&mut self, root: &Path) -> anyhow::Result<()> {
        for dir in 0..3 {
            let dir_path = root.join(format!("dir{}", dir));
            fs::create_dir_all(&dir_path)?;
            for file in 0..self.rng.random_range(1..5) {
                fs::write(dir_path.join(format!("file{}.bin", file)), self.content())?;
            }
        }
        fs::write(root.join("top.bin"), self.content())?;
        Ok(())
    }

    /// Rewrite, grow, delete and add files under `root`
    ///
    /// Every rewrite changes the length so size alone marks it as changed.
    pub fn mutate(&mut self, root: &Path) -> anyhow::Result<()> {
        for path in files_under(root) {
            match self.rng.random_range(0..4) {
                0 => {
                    let mut data = fs::read(&path)?;
                    data.extend((0..self.rng.random_range(1..64)).map(|_| self.rng.random::<u8>()));
                    fs::write(&path, data)?;
                }
                1 => fs::remove_file(&path)?,
                2 => {
                    let old_len = fs::metadata(&path)?.len() as usize;
                    let mut data = self.content();
                    if data.len() == old_len {
                        data.push(0);
                    }
                    fs::write(&path, data)?;
                }
                _ => {}
            }
        }
        fs::create_dir_all(root.join("added"))?;
        fs::write(root.join("added/new.bin"), self.content())?;
        Ok(())
    }
}

fn files_under(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Regular files and contents, ignoring the data directory
fn tree_state(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
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

/// Names of every file under `root`, to look for leftovers
fn all_names(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

fn open(dst: &Path) -> Mirror {
    RetraceBuilder::new().fsync(false).open(dst).unwrap()
}

/// Indexes and actions of every increment, ignoring session times
fn increment_shape(mirror: &Mirror) -> Vec<(String, &'static str)> {
    let mut shape: Vec<_> = mirror
        .all_increments()
        .unwrap()
        .into_iter()
        .map(|name| (name.index.to_string(), name.action.tag()))
        .collect();
    shape.sort();
    shape
}

/// Kill the second session at `point`, recover and check the invariants
fn crash_and_recover(point: FailPoint, seed: u64) {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let mut chaos = ChaosEngine::new(seed);
    chaos.populate(src.path()).unwrap();

    let mut mirror = open(dst.path());
    let first = mirror.backup_local(src.path()).unwrap().session;
    let first_state = tree_state(src.path());
    drop(mirror);

    chaos.mutate(src.path()).unwrap();
    let mut crashing = RetraceBuilder::new()
        .fsync(false)
        .fail_point(point)
        .open(dst.path())
        .unwrap();
    let err = crashing.backup_local(src.path()).unwrap_err();
    assert!(err.is_fatal(), "{:?} produced {}", point, err);
    drop(crashing);

    // Reopening runs recovery
    let mut mirror = open(dst.path());
    let recovery = mirror.last_recovery().clone();
    info!("{:?}: {:?}", point, recovery);
    assert_eq!(recovery.completed + recovery.rolled_back, 1);
    assert_eq!(recovery.logs_removed, 1);
    if point != FailPoint::BeforeJournalCommit {
        assert_eq!(recovery.rolled_back, 1);
        assert_eq!(tree_state(dst.path()), first_state);
    }
    assert_eq!(mirror.current_session().unwrap(), Some(first));
    assert!(mirror.recover().unwrap().is_clean());
    assert!(!all_names(dst.path())
        .iter()
        .any(|name| name.starts_with(".retrace-tmp.")));

    // A rerun converges and the first state is intact
    let rerun = mirror.backup_local(src.path()).unwrap();
    assert_eq!(rerun.status(), RunStatus::Clean);
    assert_eq!(tree_state(dst.path()), tree_state(src.path()));

    let out = TempDir::new().unwrap();
    let summary = mirror.restorer().restore_tree(&first, out.path()).unwrap();
    assert_eq!(summary.skipped, 0);
    assert_eq!(tree_state(out.path()), first_state);

    // The same history without a crash leaves the same increments behind
    let twin_src = TempDir::new().unwrap();
    let twin_dst = TempDir::new().unwrap();
    let mut twin_chaos = ChaosEngine::new(seed);
    twin_chaos.populate(twin_src.path()).unwrap();
    let mut twin = open(twin_dst.path());
    let twin_first = twin.backup_local(twin_src.path()).unwrap().session;
    twin_chaos.mutate(twin_src.path()).unwrap();
    twin.backup_local(twin_src.path()).unwrap();

    assert_eq!(increment_shape(&mirror), increment_shape(&twin));
    assert_eq!(tree_state(dst.path()), tree_state(twin_dst.path()));
    let twin_out = TempDir::new().unwrap();
    twin.restorer().restore_tree(&twin_first, twin_out.path()).unwrap();
    assert_eq!(tree_state(twin_out.path()), tree_state(out.path()));
}

/// Crash once the first mutation has fully landed, change the same file
/// again and rerun: the first state must still restore
fn change_after_completed_crash(v1: &[u8], v2: &[u8], v3: &[u8]) {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let file = src.path().join("f.txt");
    let index = Index::from_components(["f.txt"]);
    fs::write(&file, v1).unwrap();

    let mut mirror = open(dst.path());
    let first = mirror.backup_local(src.path()).unwrap().session;
    drop(mirror);

    fs::write(&file, v2).unwrap();
    let mut crashing = RetraceBuilder::new()
        .fsync(false)
        .fail_point(FailPoint::BeforeJournalCommit)
        .open(dst.path())
        .unwrap();
    crashing.backup_local(src.path()).unwrap_err();
    drop(crashing);

    let mut mirror = open(dst.path());
    assert_eq!(mirror.last_recovery().completed, 1);
    assert_eq!(fs::read(dst.path().join("f.txt")).unwrap(), v2);
    assert_eq!(mirror.increments_for(&index).unwrap().len(), 1);

    fs::write(&file, v3).unwrap();
    let rerun = mirror.backup_local(src.path()).unwrap();
    assert_eq!(rerun.status(), RunStatus::Clean);
    let increments = mirror.increments_for(&index).unwrap();
    assert_eq!(increments.len(), 1);
    assert_eq!(increments[0].time, first);

    let restorer = mirror.restorer();
    assert_eq!(restorer.restore_file(&index, &first).unwrap().content.unwrap(), v1);
    assert_eq!(
        restorer.restore_file(&index, &rerun.session).unwrap().content.unwrap(),
        v3
    );
}

#[test]
#[traced_test]
fn test_change_after_completed_crash_with_reverse_delta() {
    let v1: String = (0..4000).map(|i| format!("record {:05}\n", i)).collect();
    let v2 = v1.replacen("record 01000\n", "record 01000\ninserted once\n", 1);
    let v3 = v2.replacen("record 03000\n", "record 03000\ninserted again, longer\n", 1);
    change_after_completed_crash(v1.as_bytes(), v2.as_bytes(), v3.as_bytes());
}

#[test]
fn test_change_after_completed_crash_with_snapshot() {
    change_after_completed_crash(b"one", b"two, longer", b"three, longer still");
}

#[test]
#[traced_test]
fn test_crash_after_journal_begin() {
    crash_and_recover(FailPoint::AfterJournalBegin, 1);
}

#[test]
#[traced_test]
fn test_crash_after_increment_commit() {
    crash_and_recover(FailPoint::AfterIncrementCommit, 2);
}

#[test]
#[traced_test]
fn test_crash_before_journal_commit() {
    crash_and_recover(FailPoint::BeforeJournalCommit, 3);
}

#[test]
fn test_random_crash_points() {
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..6 {
        let point = FAIL_POINTS[rng.random_range(0..FAIL_POINTS.len())];
        crash_and_recover(point, 100 + round);
    }
}

#[test]
fn test_stray_temporaries_are_removed() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    ChaosEngine::new(7).populate(src.path()).unwrap();
    let mut mirror = open(dst.path());
    mirror.backup_local(src.path()).unwrap();
    drop(mirror);

    // Leftovers of a crash that happened before anything was journaled
    let data = dst.path().join("retrace-data");
    fs::write(data.join(".retrace-tmp.current_mirror"), b"junk").unwrap();
    fs::write(data.join("increments/.retrace-tmp.orphan"), b"junk").unwrap();

    let mirror = open(dst.path());
    assert_eq!(mirror.last_recovery().temps_removed, 2);
    assert!(!data.join(".retrace-tmp.current_mirror").exists());
    assert!(!data.join("increments/.retrace-tmp.orphan").exists());
}

#[test]
fn test_torn_metadata_log_is_tolerated() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let mut chaos = ChaosEngine::new(9);
    chaos.populate(src.path()).unwrap();

    let mut mirror = open(dst.path());
    let first = mirror.backup_local(src.path()).unwrap().session;
    let first_state = tree_state(src.path());

    // A torn tail where a crash cut the last line short
    let log = mirror.data_dir().log_path(&first);
    let mut bytes = fs::read(&log).unwrap();
    bytes.extend_from_slice(b"zzz\treg\tsi");
    fs::write(&log, bytes).unwrap();

    chaos.mutate(src.path()).unwrap();
    let report = mirror.backup_local(src.path()).unwrap();
    assert!(report.finalized);
    assert_eq!(tree_state(dst.path()), tree_state(src.path()));

    let out = TempDir::new().unwrap();
    let summary = mirror.restorer().restore_tree(&first, out.path()).unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(tree_state(out.path()), first_state);
}
