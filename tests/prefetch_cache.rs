//! Background prefetch into the memory cache

mod common;

use common::*;
use pakfs::{OpenMode, SourceKind};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn setup() -> (TempDir, pakfs::FileSystem) {
    let dir = TempDir::new().unwrap();
    write_file(&dir.path().join("data/cfg/a.txt"), b"alpha");
    write_pak(&dir.path().join("base.pak"), &[("maps/start.bsp", b"map bytes")]);
    let fs = filesystem(&dir);
    add(&fs, "data", "game");
    add(&fs, "base.pak", "game");
    (dir, fs)
}

#[test]
fn test_prefetched_files_served_from_memory() {
    let (dir, fs) = setup();
    let batch = fs
        .prefetch_files(["cfg/a.txt", "maps/start.bsp"], None)
        .unwrap();
    batch.wait();
    assert!(fs.is_batch_ready(&batch));
    assert_eq!(batch.len(), 2);

    // Changes on disk are not seen while the batch holds the file
    write_file(&dir.path().join("data/cfg/a.txt"), b"changed");
    let mut handle = fs.open("cfg/a.txt", OpenMode::Read, None).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Memory);
    assert_eq!(handle.read_all().unwrap(), b"alpha");
    assert_eq!(read_string(&fs, "maps/start.bsp", None), "map bytes");

    let stats = fs.cache_stats();
    assert_eq!(stats.jobs_issued, 2);
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.bytes, "alpha".len() + "map bytes".len());

    fs.destroy_batch(batch);
    assert_eq!(fs.cache_stats().entries, 0);
    assert_eq!(read_string(&fs, "cfg/a.txt", None), "changed");
}

#[test]
fn test_missing_file_is_cached_as_missing() {
    let (dir, fs) = setup();
    let batch = fs.prefetch_files(["cfg/late.txt"], None).unwrap();
    batch.wait();

    write_file(&dir.path().join("data/cfg/late.txt"), b"now here");
    let err = fs.open("cfg/late.txt", OpenMode::Read, None).unwrap_err();
    assert!(err.is_not_found());

    // A group-qualified read skips the cache
    assert_eq!(read_string(&fs, "cfg/late.txt", Some("game")), "now here");

    drop(batch);
    assert_eq!(read_string(&fs, "cfg/late.txt", None), "now here");
}

#[test]
fn test_overlapping_batches_share_one_load() {
    let (_dir, fs) = setup();
    let first = fs.prefetch_files(["cfg/a.txt"], None).unwrap();
    let second = fs.prefetch_files(["CFG/A.TXT", "maps/start.bsp"], None).unwrap();
    first.wait();
    second.wait();

    assert_eq!(fs.cache_stats().jobs_issued, 2);
    let cached = fs.context().cache.lookup("cfg/a.txt").unwrap();
    let again = fs.context().cache.lookup("cfg/a.txt").unwrap();
    assert!(Arc::ptr_eq(cached.data().unwrap(), again.data().unwrap()));

    // Still referenced by the second batch
    drop(first);
    assert!(fs.context().cache.contains("cfg/a.txt"));
    drop(second);
    assert!(!fs.context().cache.contains("cfg/a.txt"));
}

#[test]
fn test_prefetch_with_group() {
    let (dir, fs) = setup();
    write_file(&dir.path().join("mods/cfg/a.txt"), b"modded");
    add(&fs, "mods", "mod");

    let batch = fs.prefetch_files(["cfg/a.txt"], Some("mod")).unwrap();
    batch.wait();
    assert_eq!(read_string(&fs, "cfg/a.txt", None), "modded");
}

#[test]
fn test_prefetch_records_integrity_once() {
    let (_dir, fs) = setup();
    let batch = fs.prefetch_files(["cfg/a.txt"], None).unwrap();
    batch.wait();
    for _ in 0..3 {
        fs.read_file("cfg/a.txt", None).unwrap();
    }
    let records = fs.integrity_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].hash, pakfs::ContentHash::of(b"alpha"));
}

#[test]
fn test_write_after_cached_miss_reads_back() {
    let (dir, fs) = setup();
    let batch = fs.prefetch_files(["save.dat"], None).unwrap();
    batch.wait();
    assert!(fs.open("save.dat", OpenMode::Read, None).unwrap_err().is_not_found());

    let mut handle = fs.open("save.dat", OpenMode::Write, None).unwrap();
    handle.write_all(b"hello").unwrap();
    handle.close().unwrap();
    assert!(dir.path().join("data/save.dat").is_file());
    assert_eq!(read_string(&fs, "save.dat", None), "hello");

    // Prefetched again, then replaced through write_file
    let again = fs.prefetch_files(["save.dat"], None).unwrap();
    again.wait();
    assert_eq!(fs.cache_stats().jobs_issued, 2);
    let handle = fs.open("save.dat", OpenMode::Read, None).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Memory);

    fs.write_file("save.dat", None, b"second").unwrap();
    let mut handle = fs.open("save.dat", OpenMode::Read, None).unwrap();
    assert_ne!(handle.source().kind, SourceKind::Memory);
    assert_eq!(handle.read_all().unwrap(), b"second");

    drop(batch);
    drop(again);
    assert_eq!(fs.cache_stats().entries, 0);
}

#[test]
fn test_prefetch_names_match_open_lookups() {
    let (dir, fs) = setup();
    write_file(&dir.path().join("data/cfg/b.txt"), b"beta");
    std::fs::create_dir_all(dir.path().join("mods")).unwrap();
    add(&fs, "mods", "mod");

    let batch = fs
        .prefetch_files(["./cfg/../cfg/a.txt", "//mod/cfg/b.txt", "maps\\start.bsp"], None)
        .unwrap();
    batch.wait();
    assert_eq!(batch.names(), ["cfg/a.txt", "cfg/b.txt", "maps/start.bsp"]);

    let mut handle = fs.open("cfg/a.txt", OpenMode::Read, None).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Memory);
    assert_eq!(handle.read_all().unwrap(), b"alpha");
    let handle = fs.open("maps/start.bsp", OpenMode::Read, None).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Memory);

    // Loaded from the prefix group only, which has no cfg/b.txt
    assert!(fs.open("cfg/b.txt", OpenMode::Read, None).unwrap_err().is_not_found());
    assert_eq!(read_string(&fs, "cfg/b.txt", Some("game")), "beta");
}

#[test]
fn test_default_group_reads_from_cache() {
    let (_dir, fs) = setup();
    let batch = fs.prefetch_files(["cfg/a.txt"], Some("default")).unwrap();
    batch.wait();

    let handle = fs.open("cfg/a.txt", OpenMode::Read, Some("default")).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Memory);
    let handle = fs.open("//default/cfg/a.txt", OpenMode::Read, None).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Memory);
    let handle = fs.open("cfg/a.txt", OpenMode::Read, Some("game")).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Loose);
}

#[test]
fn test_dropping_filesystem_with_pending_batch() {
    let (_dir, fs) = setup();
    let names: Vec<String> = (0..50).map(|i| format!("cfg/missing{}.txt", i)).collect();
    let batch = fs.prefetch_files(&names, None).unwrap();
    drop(fs);
    // Shutdown drained every job
    assert!(batch.is_ready());
}
