//! Signed stores, whitelists and trust-restricted opens

mod common;

use common::*;
use pakfs::{
    FsError, IntegrityClass, OpenMode, OpenRequest, SearchPosition, TrustRequirement, Whitelist,
};
use tempfile::TempDir;

fn strict_whitelist(key: [u8; 32]) -> Whitelist {
    Whitelist::permissive()
        .trust_key(key)
        .with_rule("cfg/**", IntegrityClass::TrustedOnly)
}

/// Loose override first, signed store second
fn setup() -> (TempDir, pakfs::FileSystem, [u8; 32]) {
    let dir = TempDir::new().unwrap();
    let key = signing_key(11);
    write_indexed(
        dir.path(),
        "core",
        &[("cfg/a.cfg", 0, b"signed a"), ("readme.txt", 0, b"readme")],
        Some(&key),
    );
    write_file(&dir.path().join("loose/cfg/a.cfg"), b"loose a");
    write_file(&dir.path().join("loose/readme.txt"), b"loose readme");

    let fs = filesystem(&dir);
    add(&fs, "loose", "game");
    add(&fs, "core.idx", "game");
    (dir, fs, key.verifying_key().to_bytes())
}

#[test]
fn test_signed_store_trusted_only_with_whitelisted_key() {
    let (_dir, fs, key) = setup();
    let paths = fs.search_paths();
    assert!(!paths[1].trusted);

    assert!(fs.set_whitelist(Whitelist::permissive().trust_key(key)).is_empty());
    let paths = fs.search_paths();
    assert!(!paths[0].trusted);
    assert!(paths[1].trusted);
}

#[test]
fn test_trusted_only_names_skip_untrusted_entries() {
    let (_dir, fs, key) = setup();
    fs.set_whitelist(strict_whitelist(key));

    // Loose copy is first but untrusted
    assert_eq!(read_string(&fs, "cfg/a.cfg", None), "signed a");
    // Names outside the rule keep normal precedence
    assert_eq!(read_string(&fs, "readme.txt", None), "loose readme");

    let handle = fs
        .open_with(OpenRequest::read("cfg/a.cfg").trust(TrustRequirement::Any))
        .unwrap();
    assert!(!handle.source().trusted);

    let handle = fs
        .open_with(OpenRequest::read("readme.txt").trust(TrustRequirement::TrustedOnly))
        .unwrap();
    assert!(handle.source().trusted);
}

#[test]
fn test_whitelist_change_lists_files_to_reload() {
    let (_dir, fs, key) = setup();
    fs.set_whitelist(strict_whitelist(key));

    assert_eq!(read_string(&fs, "cfg/a.cfg", None), "signed a");
    let record = fs.integrity_record("cfg/a.cfg", "game").unwrap();
    assert!(record.trusted);

    // Drop the key: the file came from a source that is no longer trusted
    let reload = fs.set_whitelist(Whitelist::permissive().with_rule("cfg/**", IntegrityClass::TrustedOnly));
    assert_eq!(reload, vec!["cfg/a.cfg".to_string()]);
    assert!(fs.integrity_record("cfg/a.cfg", "game").is_none());

    let err = fs.open("cfg/a.cfg", OpenMode::Read, None).unwrap_err();
    match err {
        FsError::PolicyExcluded { name, sources, .. } => {
            assert_eq!(name, "cfg/a.cfg");
            assert_eq!(sources.len(), 2);
        }
        other => panic!("unexpected error: {}", other),
    }

    // Without restrictions the loose copy wins again and is recorded afresh
    assert!(fs.set_whitelist(Whitelist::permissive()).is_empty());
    assert_eq!(read_string(&fs, "cfg/a.cfg", None), "loose a");
    assert!(!fs.integrity_record("cfg/a.cfg", "game").unwrap().trusted);
}

#[test]
fn test_new_rule_flags_untrusted_loads() {
    let (_dir, fs, key) = setup();
    fs.set_whitelist(Whitelist::permissive().trust_key(key));
    assert_eq!(read_string(&fs, "cfg/a.cfg", None), "loose a");

    let reload = fs.set_whitelist(strict_whitelist(key));
    assert_eq!(reload, vec!["cfg/a.cfg".to_string()]);
    assert_eq!(read_string(&fs, "cfg/a.cfg", None), "signed a");
}

#[test]
fn test_tampered_signature_is_not_trusted() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(3);
    let index = write_indexed(dir.path(), "core", &[("a.txt", 0, b"a")], Some(&key));
    let mut bytes = std::fs::read(&index).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&index, bytes).unwrap();

    let fs = filesystem(&dir);
    fs.set_whitelist(Whitelist::permissive().trust_key(key.verifying_key().to_bytes()));
    add(&fs, "core.idx", "game");
    assert!(!fs.search_paths()[0].trusted);
    assert_eq!(read_string(&fs, "a.txt", None), "a");

    let reports = fs.verify_archives();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].signed);
    assert!(!reports[0].signature_valid);
    assert!(!reports[0].is_ok());
}

#[test]
fn test_tampered_chunk_is_never_served_as_trusted() {
    let (dir, fs, key) = setup();
    fs.set_whitelist(strict_whitelist(key));

    // Same length as the original chunk, so only the hashes can tell
    write_file(&dir.path().join("core.000"), b"EVIL!!!!readme");

    let err = fs
        .open_with(OpenRequest::read("cfg/a.cfg").trust(TrustRequirement::TrustedOnly))
        .unwrap_err();
    assert!(matches!(err, FsError::PolicyExcluded { .. }));
    assert!(fs.integrity_record("cfg/a.cfg", "game").is_none());

    // Store first: a failed hash check falls through to the next entry
    assert!(fs.add_search_path("loose", "game", SearchPosition::Tail));
    assert!(fs.search_paths()[0].location.ends_with("core.idx"));
    let mut handle = fs
        .open_with(OpenRequest::read("cfg/a.cfg").trust(TrustRequirement::Any))
        .unwrap();
    assert_eq!(handle.read_all().unwrap(), b"loose a");
    assert!(!handle.source().trusted);

    // The untouched entry of the same chunk still verifies
    let mut handle = fs
        .open_with(OpenRequest::read("readme.txt").trust(TrustRequirement::TrustedOnly))
        .unwrap();
    assert_eq!(handle.read_all().unwrap(), b"readme");
    assert!(handle.source().trusted);
}

#[test]
fn test_recorded_hash_matches_served_bytes() {
    let (_dir, fs, key) = setup();
    fs.set_whitelist(strict_whitelist(key));

    let mut handle = fs.open("cfg/a.cfg", OpenMode::Read, None).unwrap();
    let served = handle.read_all().unwrap();
    let record = fs.integrity_record("cfg/a.cfg", "game").unwrap();
    assert!(record.trusted);
    assert_eq!(record.hash, pakfs::ContentHash::of(&served));
}

#[test]
fn test_trust_is_evaluated_for_paths_added_later() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(5);
    write_indexed(dir.path(), "late", &[("x.txt", 0, b"x")], Some(&key));
    let fs = filesystem(&dir);
    fs.set_whitelist(Whitelist::permissive().trust_key(key.verifying_key().to_bytes()));

    assert!(fs.add_search_path("late.idx", "game", SearchPosition::Head));
    assert!(fs.search_paths()[0].trusted);
}

#[test]
fn test_whitelist_from_toml() {
    let key = signing_key(11).verifying_key().to_bytes();
    let text = format!(
        "default_class = \"any\"\ntrusted_keys = [\"{}\"]\n\n[[rules]]\npattern = \"cfg/**\"\nclass = \"trusted_only\"\n",
        hex::encode(key)
    );
    let whitelist = Whitelist::from_toml_str(&text).unwrap();
    assert!(whitelist.trusts_key(&key));
    assert_eq!(whitelist.class_for("cfg/a.cfg"), IntegrityClass::TrustedOnly);
    assert_eq!(whitelist.class_for("maps/a.bsp"), IntegrityClass::Any);

    let bad = Whitelist::from_toml_str("trusted_keys = [\"not-hex\"]").unwrap_err();
    assert!(matches!(bad, FsError::InvalidKey(_)));
}
