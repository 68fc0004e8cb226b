//! Storage backends selected from URIs.

use cohort_io::{build_storage_from_uri, FsStorage};
use cohort_store::Storage;

#[test]
fn test_file_uri_write_read() {
    let dir = tempfile::tempdir().unwrap();
    let uri = format!("file://{}", dir.path().display());
    let storage = build_storage_from_uri(&uri).expect("fs storage");

    storage.write("runs/a.ckpt", b"hello world").unwrap();
    assert_eq!(storage.read("runs/a.ckpt").unwrap().unwrap(), b"hello world");
    assert!(dir.path().join("runs/a.ckpt").exists());
    assert!(storage.read("runs/missing").unwrap().is_none());
}

#[test]
fn test_bare_path_and_memory_uris() {
    let dir = tempfile::tempdir().unwrap();
    let fs = build_storage_from_uri(&dir.path().display().to_string()).unwrap();
    fs.write("x", b"1").unwrap();
    assert!(fs.exists("x").unwrap());

    let mem = build_storage_from_uri("memory://").unwrap();
    mem.write("k", b"v").unwrap();
    assert_eq!(mem.list("").unwrap(), vec!["k".to_string()]);
}

#[test]
fn test_invalid_scheme_errors() {
    let err = build_storage_from_uri("ftp://example.com/state")
        .err()
        .expect("should fail");
    assert!(err.to_string().contains("ftp"));
}

#[test]
fn test_overwrite_is_whole_and_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    storage.write("cache/ab/entry", &[1u8; 4096]).unwrap();
    storage.write("cache/ab/entry", b"short").unwrap();
    assert_eq!(storage.read("cache/ab/entry").unwrap().unwrap(), b"short");
    assert_eq!(storage.list("cache").unwrap(), vec!["cache/ab/entry".to_string()]);

    storage.delete("cache/ab/entry").unwrap();
    storage.delete("cache/ab/entry").unwrap();
    assert!(storage.list("cache").unwrap().is_empty());
}

#[test]
fn test_parent_escape_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    assert!(storage.write("../outside", b"x").is_err());
}
