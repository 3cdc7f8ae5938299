//! Main test module for Retrace
//!
//! This module includes all test suites:
//! - Integration tests for multi-session scenarios
//! - Chaos tests for crash safety
//! - Property-based tests for invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::retrace::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn open(dst: &Path) -> Mirror {
        RetraceBuilder::new().fsync(false).open(dst).unwrap()
    }

    #[test]
    fn test_empty_source() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let mut mirror = open(dst.path());

        let report = mirror.backup_local(src.path()).unwrap();
        assert!(report.finalized);
        assert_eq!(report.counts.new, 0);

        // Only the data directory lives in the mirror
        let names: Vec<_> = fs::read_dir(dst.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("retrace-data")]);
    }

    #[test]
    fn test_special_filenames() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        // Names that need escaping in the metadata log
        let special_names = vec![
            "file with spaces.txt",
            "tab\there.txt",
            "new\nline.txt",
            "back\\slash.txt",
            "ünïcödé.txt",
            "retrace-data.txt",
        ];
        for name in &special_names {
            fs::write(src.path().join(name), name.as_bytes()).unwrap();
        }

        let mut mirror = open(dst.path());
        let session = mirror.backup_local(src.path()).unwrap().session;
        assert!(mirror.backup_local(src.path()).unwrap().skipped.is_empty());

        mirror
            .restorer()
            .restore_tree(&session, out.path())
            .unwrap();
        for name in &special_names {
            assert_eq!(fs::read(out.path().join(name)).unwrap(), name.as_bytes());
        }
    }

    #[test]
    fn test_empty_directory_preserved() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("empty/nested")).unwrap();

        let mut mirror = open(dst.path());
        let session = mirror.backup_local(src.path()).unwrap().session;
        assert!(dst.path().join("empty/nested").is_dir());

        fs::remove_dir_all(src.path().join("empty")).unwrap();
        let report = mirror.backup_local(src.path()).unwrap();
        assert_eq!(report.counts.deleted, 2);
        assert!(!dst.path().join("empty").exists());

        let restored = out.path().join("restored");
        mirror.restorer().restore_tree(&session, &restored).unwrap();
        assert!(restored.join("empty/nested").is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_restoration() {
        use std::os::unix::fs::symlink;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(src.path().join("target.txt"), "target").unwrap();
        symlink("target.txt", src.path().join("link")).unwrap();

        let mut mirror = open(dst.path());
        let first = mirror.backup_local(src.path()).unwrap().session;
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            Path::new("target.txt")
        );

        // Retarget the link
        fs::remove_file(src.path().join("link")).unwrap();
        symlink("elsewhere", src.path().join("link")).unwrap();
        let second = mirror.backup_local(src.path()).unwrap();
        assert_eq!(second.counts.changed, 1);
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            Path::new("elsewhere")
        );

        let restored = out.path().join("restored");
        mirror.restorer().restore_tree(&first, &restored).unwrap();
        assert_eq!(
            fs::read_link(restored.join("link")).unwrap(),
            Path::new("target.txt")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_change_is_metadata_only() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let file = src.path().join("script.sh");
        fs::write(&file, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();

        let mut mirror = open(dst.path());
        mirror.backup_local(src.path()).unwrap();

        fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();
        let report = mirror.backup_local(src.path()).unwrap();
        assert_eq!(report.counts.metadata_only, 1);
        assert_eq!(report.counts.changed, 0);
        assert_eq!(report.increments_written, 0);

        let mode = fs::metadata(dst.path().join("script.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_restore_unknown_session() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("f"), "x").unwrap();
        let mut mirror = open(dst.path());
        mirror.backup_local(src.path()).unwrap();

        let never = SessionId::from_datetime(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
        let err = mirror
            .restorer()
            .restore_file(&Index::from_components(["f"]), &never)
            .unwrap_err();
        assert!(matches!(err, RetraceError::SessionNotFound(_)));
    }
}
