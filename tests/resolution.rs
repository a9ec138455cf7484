//! Name resolution across loose directories and archives

mod common;

use common::*;
use pakfs::{EmbeddedWindow, FsError, OpenMode, SearchPosition, SourceKind};
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::TempDir;

fn data_and_pak(dir: &TempDir) {
    write_file(&dir.path().join("data/cfg/settings.txt"), b"loose settings");
    write_pak(
        &dir.path().join("base.pak"),
        &[
            ("cfg/settings.txt", b"packed settings"),
            ("cfg/defaults.txt", b"packed defaults"),
        ],
    );
}

#[test]
fn test_earlier_entry_wins_regardless_of_kind() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);

    add(&fs, "data", "game");
    add(&fs, "base.pak", "game");
    assert_eq!(read_string(&fs, "cfg/settings.txt", None), "loose settings");
    assert_eq!(read_string(&fs, "cfg/defaults.txt", None), "packed defaults");

    // Same archive mounted again in front under another group
    assert!(fs.add_search_path("base.pak", "assets", SearchPosition::Head));
    let paths = fs.search_paths();
    assert_eq!(paths.len(), 3);
    assert_eq!(paths[0].store_id, paths[2].store_id);
    assert_eq!(read_string(&fs, "cfg/settings.txt", None), "packed settings");

    let handle = fs.open("cfg/settings.txt", OpenMode::Read, None).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Archive);
    assert!(handle.source().location.ends_with("base.pak"));
}

#[test]
fn test_readding_loose_directory_moves_it() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);

    add(&fs, "data", "game");
    add(&fs, "base.pak", "game");
    assert!(fs.add_search_path("data", "game", SearchPosition::Tail));

    let paths = fs.search_paths();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0].kind, "sequential");
    assert_eq!(paths[1].kind, "loose");
    assert_eq!(read_string(&fs, "cfg/settings.txt", None), "packed settings");
}

#[test]
fn test_results_are_deterministic() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "base.pak", "game");
    add(&fs, "data", "game");

    let first = fs.resolve_location("cfg/settings.txt", None).unwrap();
    for _ in 0..20 {
        assert_eq!(fs.resolve_location("cfg/settings.txt", None).unwrap(), first);
    }
}

#[test]
fn test_lookup_ignores_case() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "base.pak", "game");
    assert_eq!(read_string(&fs, "CFG\\Defaults.TXT", None), "packed defaults");
}

#[test]
fn test_group_restricts_candidates() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    write_file(&dir.path().join("mods/cfg/settings.txt"), b"mod settings");
    let fs = filesystem(&dir);

    add(&fs, "data", "game");
    add(&fs, "mods", "mod");

    assert_eq!(read_string(&fs, "cfg/settings.txt", None), "loose settings");
    assert_eq!(read_string(&fs, "cfg/settings.txt", Some("mod")), "mod settings");
    assert_eq!(read_string(&fs, "//mod/cfg/settings.txt", None), "mod settings");
    // The embedded group overrides the explicit one
    assert_eq!(read_string(&fs, "//mod/cfg/settings.txt", Some("game")), "mod settings");

    let err = fs.read_file("cfg/settings.txt", Some("nothing")).unwrap_err();
    match err {
        FsError::NotFound { name, group, mode } => {
            assert_eq!(name, "cfg/settings.txt");
            assert_eq!(group.as_deref(), Some("nothing"));
            assert_eq!(mode, OpenMode::Read);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_same_directory_under_two_groups() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "data", "game");
    add(&fs, "data", "mod");

    let paths = fs.search_paths();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0].store_id, paths[1].store_id);
    assert_eq!(read_string(&fs, "cfg/settings.txt", Some("game")), "loose settings");
    assert_eq!(read_string(&fs, "cfg/settings.txt", Some("mod")), "loose settings");
}

#[test]
fn test_missing_file_is_not_found() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "data", "game");

    let err = fs.open("cfg/absent.txt", OpenMode::Read, None).unwrap_err();
    assert!(err.is_not_found());
    assert!(!fs.exists("cfg/absent.txt", None));
    assert!(fs.exists("cfg/settings.txt", None));
}

#[test]
fn test_compressed_entries() {
    let dir = TempDir::new().unwrap();
    let text = "compressible ".repeat(200);
    let archive = sequential_archive(&[
        ("a.txt", METHOD_LZ4, text.as_bytes()),
        ("b.txt", METHOD_ZSTD, text.as_bytes()),
        ("c.txt", METHOD_STORED, b"plain"),
    ]);
    write_file(&dir.path().join("packed.pak"), &archive);
    let fs = filesystem(&dir);
    add(&fs, "packed.pak", "game");

    assert_eq!(read_string(&fs, "a.txt", None), text);
    assert_eq!(read_string(&fs, "b.txt", None), text);
    assert_eq!(read_string(&fs, "c.txt", None), "plain");
}

#[test]
fn test_archive_handle_seek_and_tell() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "base.pak", "game");

    let mut handle = fs.open("cfg/settings.txt", OpenMode::Read, None).unwrap();
    assert_eq!(handle.size().unwrap(), 15);
    handle.seek(SeekFrom::Start(7)).unwrap();
    assert_eq!(handle.tell().unwrap(), 7);

    let mut rest = String::new();
    handle.read_to_string(&mut rest).unwrap();
    assert_eq!(rest, "settings");

    handle.seek(SeekFrom::End(-8)).unwrap();
    handle.seek(SeekFrom::Current(-1)).unwrap();
    assert_eq!(handle.tell().unwrap(), 6);
    assert!(handle.seek(SeekFrom::Current(-100)).is_err());
    assert!(handle.write(b"x").is_err());
}

#[test]
fn test_absolute_archive_path() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "base.pak", "game");

    let pak = dir.path().join("base.pak");
    let name = format!("{}/cfg/settings.txt", pak.display());
    assert_eq!(read_string(&fs, &name, None), "packed settings");

    let missing = format!("{}/cfg/none.txt", pak.display());
    assert!(fs.read_file(&missing, None).unwrap_err().is_not_found());

    // Absolute paths outside any archive open directly
    let loose = dir.path().join("data/cfg/settings.txt");
    let handle = fs.open(&loose.to_string_lossy(), OpenMode::Read, None).unwrap();
    assert_eq!(handle.source().kind, SourceKind::Direct);
}

#[test]
fn test_write_fallback_order() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("game")).unwrap();
    std::fs::create_dir_all(dir.path().join("saves")).unwrap();
    std::fs::create_dir_all(dir.path().join("default")).unwrap();
    let fs = filesystem(&dir);
    add(&fs, "game", "game");
    add(&fs, "saves", "game_write");
    add(&fs, "default", "default_write_path");

    fs.write_file("slot1/save.dat", Some("game"), b"progress").unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("saves/slot1/save.dat")).unwrap(),
        b"progress"
    );

    fs.write_file("log.txt", None, b"log").unwrap();
    assert!(dir.path().join("default/log.txt").is_file());

    fs.write_file("other.txt", Some("unknown"), b"x").unwrap();
    assert!(dir.path().join("default/other.txt").is_file());
}

#[test]
fn test_write_then_read_round_trip() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("user")).unwrap();
    let fs = filesystem(&dir);
    add(&fs, "user", "user");

    let mut handle = fs.open("notes/today.txt", OpenMode::Write, Some("user")).unwrap();
    handle.write_all(b"first line\n").unwrap();
    handle.close().unwrap();

    let mut handle = fs.open("notes/today.txt", OpenMode::Append, Some("user")).unwrap();
    handle.write_all(b"second line\n").unwrap();
    handle.close().unwrap();

    assert_eq!(
        read_string(&fs, "notes/today.txt", Some("user")),
        "first line\nsecond line\n"
    );

    let mut handle = fs.open("notes/today.txt", OpenMode::ReadUpdate, Some("user")).unwrap();
    handle.write_all(b"FIRST").unwrap();
    handle.close().unwrap();
    assert_eq!(
        read_string(&fs, "notes/today.txt", None),
        "FIRST line\nsecond line\n"
    );

    let err = fs.open("notes/absent.txt", OpenMode::ReadUpdate, Some("user")).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_write_without_writable_entry_fails() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "base.pak", "game");

    let err = fs.write_file("out.txt", Some("game"), b"x").unwrap_err();
    match err {
        FsError::NotFound { mode, .. } => assert_eq!(mode, OpenMode::Write),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_embedded_archive_in_map_host() {
    let dir = TempDir::new().unwrap();
    let pak = sequential_archive(&[("maps/arena.ent", METHOD_STORED, b"entities")]);
    let mut host = vec![0xAAu8; 100];
    host.extend_from_slice(&pak);
    host.extend_from_slice(&[0xBB; 16]);
    write_file(&dir.path().join("arena.bsp"), &host);

    let fs = filesystem(&dir);
    let window = EmbeddedWindow {
        offset: 100,
        length: pak.len() as u64,
    };
    assert!(fs.add_embedded_archive("arena.bsp", window, "game", SearchPosition::Head));

    let handle = fs.open("maps/arena.ent", OpenMode::Read, None).unwrap();
    assert!(handle.source().trusted);
    drop(handle);
    assert_eq!(read_string(&fs, "maps/arena.ent", None), "entities");

    assert_eq!(fs.remove_embedded_archive("arena.bsp", window, None), 1);
    assert!(fs.read_file("maps/arena.ent", None).is_err());
}

#[test]
fn test_integrity_recorded_on_first_load() {
    let dir = TempDir::new().unwrap();
    data_and_pak(&dir);
    let fs = filesystem(&dir);
    add(&fs, "data", "game");
    add(&fs, "base.pak", "game");

    fs.read_file("cfg/settings.txt", None).unwrap();
    fs.read_file("cfg/defaults.txt", None).unwrap();

    let record = fs.integrity_record("cfg/settings.txt", "game").unwrap();
    assert_eq!(record.hash, pakfs::ContentHash::of(b"loose settings"));
    assert!(!record.trusted);

    let records = fs.integrity_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].filename, "cfg/defaults.txt");
}
