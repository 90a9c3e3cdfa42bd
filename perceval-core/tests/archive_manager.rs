use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::tempdir;

use perceval_core::dates::default_datetime;
use perceval_core::{ArchiveError, ArchiveManager, RawPage};

#[test]
fn test_create_archive_uses_a_two_level_layout() {
    let dir = tempdir().unwrap();
    let manager = ArchiveManager::new(dir.path().join("archives")).unwrap();

    let archive = manager.create_archive().unwrap();
    let relative = archive.path().strip_prefix(manager.dirpath()).unwrap();
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].len(), 2);
    assert_eq!(parts[1].len(), 30);
    assert_eq!(manager.stored_archives().unwrap(), vec![archive.path().to_path_buf()]);
}

#[test]
fn test_collect_archives_by_origin_backend_and_date() {
    let dir = tempdir().unwrap();
    let manager = ArchiveManager::new(dir.path()).unwrap();

    let mut first = manager.create_archive().unwrap();
    first
        .init_metadata("http://example.com/", "Jira", "0.1.0", json!({}))
        .unwrap();
    let mut second = manager.create_archive().unwrap();
    second
        .init_metadata("http://example.com/", "Jira", "0.1.0", json!({}))
        .unwrap();
    let mut other = manager.create_archive().unwrap();
    other
        .init_metadata("stackoverflow", "StackExchange", "0.4.0", json!({}))
        .unwrap();
    // Never initialised: not a candidate for any backend.
    manager.create_archive().unwrap();

    let found = manager
        .collect_archives("http://example.com/", "Jira", default_datetime())
        .unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.contains(&first.path().to_path_buf()));
    assert!(found.contains(&second.path().to_path_buf()));

    let future = Utc::now() + Duration::hours(1);
    assert!(manager
        .collect_archives("http://example.com/", "Jira", future)
        .unwrap()
        .is_empty());
}

#[test]
fn test_delete_archives() {
    let dir = tempdir().unwrap();
    let manager = ArchiveManager::new(dir.path()).unwrap();

    let mut kept = manager.create_archive().unwrap();
    kept.store(&RawPage::from("page")).unwrap();
    let removed = manager.create_archive().unwrap();
    let removed_path = removed.path().to_path_buf();

    manager.delete_archive(removed).unwrap();
    assert!(!removed_path.exists());
    assert!(matches!(
        manager.load_archive(&removed_path),
        Err(ArchiveError::NotFound(_))
    ));
    assert_eq!(manager.stored_archives().unwrap().len(), 1);

    assert_eq!(manager.delete_archives().unwrap(), 1);
    assert!(manager.stored_archives().unwrap().is_empty());
}
