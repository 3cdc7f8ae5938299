//! Property-based testing for Retrace
//!
//! Uses proptest to verify invariants across randomly generated names,
//! contents and tree histories.

use ::retrace::delta::{delta, patch, signature};
use ::retrace::increment::{IncrementAction, IncrementName};
use ::retrace::metadata::{decode_record, encode_record, quote, unquote};
use ::retrace::record::{DeviceKind, Owner};
use ::retrace::*;
use chrono::{TimeZone, Utc};
use filetime::FileTime;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// File names: any bytes except `/` and NUL, never `.` or `..`
fn name_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>().prop_filter("separator", |b| *b != b'/' && *b != 0), 1..24)
        .prop_filter("dot names", |n| n != b"." && n != b"..")
}

fn action_strategy() -> impl Strategy<Value = IncrementAction> {
    prop_oneof![
        Just(IncrementAction::Diff),
        Just(IncrementAction::Missing),
        Just(IncrementAction::Snapshot),
        Just(IncrementAction::Dir),
    ]
}

/// Session ids between 2000 and 2100
fn session_strategy() -> impl Strategy<Value = SessionId> {
    (946_684_800_000_000i64..4_102_444_800_000_000i64).prop_map(|micros| {
        SessionId::from_datetime(Utc.timestamp_micros(micros).unwrap())
    })
}

fn owner_strategy() -> impl Strategy<Value = Owner> {
    (any::<u32>(), any::<u32>()).prop_map(|(uid, gid)| Owner { uid, gid })
}

/// Every attribute variant, with optional fields both set and unset
fn attrs_strategy() -> impl Strategy<Value = FileAttrs> {
    let perms = 0u32..0o10000;
    let xattrs = prop::option::of(prop::collection::vec(any::<u8>(), 0..32));
    prop_oneof![
        (
            any::<u64>(),
            any::<i64>(),
            perms.clone(),
            owner_strategy(),
            xattrs.clone(),
            prop::option::of("[0-9a-f]{64}"),
        )
            .prop_map(|(size, mtime, perms, owner, xattrs, fingerprint)| FileAttrs::Regular {
                size,
                mtime,
                perms,
                owner,
                xattrs,
                fingerprint,
            }),
        (any::<i64>(), perms.clone(), owner_strategy(), xattrs).prop_map(
            |(mtime, perms, owner, xattrs)| FileAttrs::Directory {
                mtime,
                perms,
                owner,
                xattrs,
            }
        ),
        (prop::collection::vec(any::<u8>(), 1..64), owner_strategy())
            .prop_map(|(target, owner)| FileAttrs::Symlink { target, owner }),
        (perms.clone(), owner_strategy()).prop_map(|(perms, owner)| FileAttrs::Fifo { perms, owner }),
        (perms.clone(), owner_strategy()).prop_map(|(perms, owner)| FileAttrs::Socket { perms, owner }),
        (
            prop_oneof![Just(DeviceKind::Char), Just(DeviceKind::Block)],
            any::<u64>(),
            any::<u64>(),
            perms,
            owner_strategy(),
        )
            .prop_map(|(kind, major, minor, perms, owner)| FileAttrs::Device {
                kind,
                major,
                minor,
                perms,
                owner,
            }),
        Just(FileAttrs::Missing),
    ]
}

/// Generate random file content
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        // Small text files
        "[a-zA-Z0-9 \n]{0,300}".prop_map(|s| s.into_bytes()),
        // Binary data
        prop::collection::vec(any::<u8>(), 0..2000),
        // Repetitive patterns
        (any::<u8>(), 1..1000usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

/// One tree state: up to six files across two directories
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    let path = prop_oneof![
        "[a-d]".prop_map(|s| s),
        "dir1/[a-d]".prop_map(|s| s),
        "dir2/[a-d]".prop_map(|s| s),
    ];
    prop::collection::btree_map(path, content_strategy(), 0..6)
}

/// Make `root` hold exactly `tree`, stamping every file with `mtime`
///
/// The stamp differs per session so a rewrite of equal size is never
/// mistaken for an unchanged file.
fn apply_tree(root: &Path, tree: &BTreeMap<String, Vec<u8>>, mtime: i64) {
    for entry in fs::read_dir(root).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }
    for (relative, content) in tree {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }
}

fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap();
            (relative.to_string_lossy().into_owned(), fs::read(e.path()).unwrap())
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_quote_round_trip(raw in prop::collection::vec(any::<u8>(), 0..200)) {
        let quoted = quote(&raw);
        prop_assert!(!quoted.contains(&b'\n'));
        prop_assert!(!quoted.contains(&b'\t'));
        prop_assert_eq!(unquote(&quoted).unwrap(), raw);
    }

    #[test]
    fn prop_record_line_round_trip(
        components in prop::collection::vec(name_strategy(), 0..4),
        attrs in attrs_strategy(),
        line_no in 1usize..10_000,
    ) {
        let record = FileRecord::new(Index::from_components(components), attrs);
        let line = encode_record(&record);
        prop_assert!(!line.contains(&b'\n'));
        let decoded = decode_record(&line, line_no).unwrap();
        prop_assert_eq!(&decoded.index, &record.index);
        prop_assert_eq!(&decoded.attrs, &record.attrs);
    }

    #[test]
    fn prop_session_id_round_trip(session in session_strategy()) {
        let quoted = session.quoted();
        prop_assert!(!quoted.contains('.'));
        prop_assert_eq!(SessionId::parse(&quoted).unwrap(), session);
    }

    #[test]
    fn prop_session_order_matches_quoted_order(a in session_strategy(), b in session_strategy()) {
        prop_assert_eq!(a.cmp(&b), a.quoted().cmp(&b.quoted()));
    }

    #[test]
    fn prop_increment_name_parses_from_the_right(
        parent in prop::collection::vec(name_strategy(), 0..3),
        base in name_strategy(),
        session in session_strategy(),
        action in action_strategy(),
    ) {
        let parent = Index::from_components(parent);
        let mut file_name = base.clone();
        file_name.extend_from_slice(format!(".{}.{}", session.quoted(), action.tag()).as_bytes());

        let parsed = IncrementName::parse(&parent, &file_name).unwrap();
        prop_assert_eq!(parsed, IncrementName::new(parent.child(&base), session, action));
    }

    #[test]
    fn prop_patch_inverts_delta(
        old in content_strategy(),
        new in content_strategy(),
        block_size in 1usize..64,
    ) {
        let sig = signature(&old, block_size);
        let forward = delta(&sig, &new);
        prop_assert_eq!(forward.target_len, new.len() as u64);
        prop_assert_eq!(patch(&old, &forward).unwrap(), new);
    }

    #[test]
    fn prop_edit_keeps_literals_small(
        base in prop::collection::vec(any::<u8>(), 2048..4096),
        at in 0usize..2048,
        insert in prop::collection::vec(any::<u8>(), 1..32),
    ) {
        let mut edited = base.clone();
        edited.splice(at..at, insert.iter().copied());

        let block_size = 64;
        let forward = delta(&signature(&base, block_size), &edited);
        // At most the block around the edit, the insertion and a partial tail
        prop_assert!(forward.literal_bytes() <= (insert.len() + 3 * block_size) as u64);
        prop_assert_eq!(patch(&base, &forward).unwrap(), edited);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_every_session_restores(history in prop::collection::vec(tree_strategy(), 1..4)) {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let mut mirror = RetraceBuilder::new().fsync(false).open(dst.path()).unwrap();

        let mut sessions = Vec::new();
        for (round, tree) in history.iter().enumerate() {
            apply_tree(src.path(), tree, 1_600_000_000 + round as i64 * 60);
            let report = mirror.backup_local(src.path()).unwrap();
            prop_assert_eq!(report.status(), RunStatus::Clean);
            sessions.push(report.session);
        }

        for (session, tree) in sessions.iter().zip(&history) {
            let out = TempDir::new().unwrap();
            let summary = mirror.restorer().restore_tree(session, out.path()).unwrap();
            prop_assert_eq!(summary.skipped, 0);
            prop_assert_eq!(&read_tree(out.path()), tree);
        }
    }
}
