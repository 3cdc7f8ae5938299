//! End-to-end tests for Retrace
//!
//! These drive whole sessions through [`Mirror`] and check the mirror, the
//! increments and restored states together.

#[cfg(test)]
mod integration_tests {
    use crate::increment::IncrementAction;
    use crate::metadata::find_record;
    use crate::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_basic_workflow() {
        // Create test directories
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let x = Index::from_components(["x"]);

        let mut mirror = RetraceBuilder::new().fsync(false).open(dst.path()).unwrap();

        // First session: a plain copy
        fs::write(src.path().join("x"), "hello").unwrap();
        let first = mirror.backup_local(src.path()).unwrap();
        assert_eq!(first.status(), RunStatus::Clean);
        assert_eq!(fs::read_to_string(dst.path().join("x")).unwrap(), "hello");
        assert!(mirror.increments_for(&x).unwrap().is_empty());

        // Second session stores what the mirror held before
        fs::write(src.path().join("x"), "hello world").unwrap();
        let second = mirror.backup_local(src.path()).unwrap();
        assert_eq!(second.previous, Some(first.session));
        assert_eq!(second.counts.changed, 1);
        assert_eq!(second.increments_written, 1);
        assert_eq!(fs::read_to_string(dst.path().join("x")).unwrap(), "hello world");

        let increments = mirror.increments_for(&x).unwrap();
        assert_eq!(increments.len(), 1);
        // Named after the session whose state it restores
        assert_eq!(increments[0].time, first.session);
        assert_eq!(increments[0].action, IncrementAction::Snapshot);

        // Each session logged the state it saw
        let logged = find_record(&mirror.data_dir().log_path(&first.session), &x)
            .unwrap()
            .unwrap();
        assert_eq!(logged.attrs.size(), 5);

        // Restore to the first session
        let restored = mirror.restorer().restore_file(&x, &first.session).unwrap();
        assert_eq!(restored.content.unwrap(), b"hello");
        let latest = mirror.restorer().restore_file(&x, &second.session).unwrap();
        assert_eq!(latest.content.unwrap(), b"hello world");
    }

    #[test]
    fn test_second_run_without_changes_writes_nothing() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/c.txt"), "deep").unwrap();
        fs::write(src.path().join("top.txt"), "top").unwrap();

        let mut mirror = RetraceBuilder::new().fsync(false).open(dst.path()).unwrap();
        mirror.backup_local(src.path()).unwrap();
        let again = mirror.backup_local(src.path()).unwrap();

        assert!(again.finalized);
        assert_eq!(again.counts.new, 0);
        assert_eq!(again.counts.changed, 0);
        assert_eq!(again.counts.deleted, 0);
        assert_eq!(again.increments_written, 0);
        assert!(again.skipped.is_empty());
        assert_eq!(mirror.sessions().unwrap().len(), 2);
        assert_eq!(fs::read_to_string(dst.path().join("a/b/c.txt")).unwrap(), "deep");
    }

    #[test]
    fn test_guarded_transports() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("file"), "data").unwrap();

        let mirror_side = GuardedTransport::new(
            LocalTransport::new(),
            Arc::new(RestrictedPolicy::read_write(dst.path())),
        );
        let source_side = GuardedTransport::new(
            LocalTransport::new(),
            Arc::new(RestrictedPolicy::read_only(src.path())),
        );
        let config = RetraceBuilder::new().fsync(false).build().unwrap();
        let mut mirror = Mirror::open_with(dst.path(), config, Arc::new(mirror_side)).unwrap();
        let report = mirror.backup(Arc::new(source_side), src.path(), None).unwrap();

        assert_eq!(report.status(), RunStatus::Clean);
        assert_eq!(fs::read_to_string(dst.path().join("file")).unwrap(), "data");
    }

    #[test]
    fn test_read_only_mirror_side_aborts() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("file"), "data").unwrap();

        let read_only = GuardedTransport::new(
            LocalTransport::new(),
            Arc::new(RestrictedPolicy::read_only(dst.path())),
        );
        let config = RetraceBuilder::new().fsync(false).build().unwrap();
        let mut mirror = Mirror::open_with(dst.path(), config, Arc::new(read_only)).unwrap();
        let err = mirror.backup_local(src.path()).unwrap_err();

        assert!(matches!(err, RetraceError::SecurityViolation { .. }));
        assert!(!dst.path().join("file").exists());
        assert_eq!(mirror.current_session().unwrap(), None);
    }
}
