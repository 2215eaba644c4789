use serde_json::json;
use tempfile::tempdir;
use trunkdb::btree::{BPlusTrunk, DATA_FILE_NAME, WAL_FILE_NAME};
use trunkdb::pager::Superblock;
use trunkdb::{BPlusOptions, Nut, Trunk, TrunkError};

fn small_pages() -> BPlusOptions {
    BPlusOptions { page_size: 4096, ..BPlusOptions::default() }
}

#[test]
fn write_read_restart() {
    let dir = tempdir().unwrap();
    {
        let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
        trunk.stash("k1", &Nut::new("k1", json!({"v": 1}))).unwrap();
        trunk.flush().unwrap();
    }
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    let nut = trunk.crack("k1").unwrap().expect("k1 must survive restart");
    assert_eq!(nut.payload, json!({"v": 1}));
}

#[test]
fn inserts_split_pages_and_scans_stay_ordered() {
    let dir = tempdir().unwrap();
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    // Insert in shuffled order so splits exercise both directions.
    let mut keys: Vec<String> = (0..300).map(|i| format!("k{i:04}")).collect();
    let shuffled: Vec<String> = keys
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 0)
        .map(|(_, k)| k.clone())
        .chain(
            keys.iter()
                .enumerate()
                .filter(|(i, _)| i % 2 == 1)
                .map(|(_, k)| k.clone()),
        )
        .collect();
    for key in &shuffled {
        trunk.stash(key, &Nut::new(key, json!({"key": key}))).unwrap();
    }
    assert_eq!(trunk.entry_count(), 300);

    for key in &keys {
        let nut = trunk.crack(key).unwrap().unwrap_or_else(|| panic!("missing {key}"));
        assert_eq!(nut.payload["key"], json!(key));
    }

    let all = trunk.crack_all().unwrap();
    let scanned: Vec<String> = all.iter().map(|n| n.key.clone()).collect();
    keys.sort();
    assert_eq!(scanned, keys, "leaf chain must yield keys in order");
}

#[test]
fn range_scan_covers_exactly_the_bounds() {
    let dir = tempdir().unwrap();
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    for i in 0..200 {
        let key = format!("k{i:04}");
        trunk.stash(&key, &Nut::new(&key, json!(i))).unwrap();
    }

    let hits = trunk.scan_range("k0050", "k0060").unwrap();
    let keys: Vec<String> = hits.iter().map(|n| n.key.clone()).collect();
    let expected: Vec<String> = (50..60).map(|i| format!("k{i:04}")).collect();
    assert_eq!(keys, expected);

    assert!(trunk.scan_range("k0060", "k0050").unwrap().is_empty());
    assert!(trunk.scan_range("zzz", "zzzz").unwrap().is_empty());
    // Half-open: the end bound itself is excluded.
    assert!(hits.iter().all(|n| n.key.as_str() < "k0060"));
}

#[test]
fn overwrite_keeps_entry_count() {
    let dir = tempdir().unwrap();
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    trunk.stash("k", &Nut::new("k", json!(1))).unwrap();
    trunk.stash("k", &Nut::new("k", json!(2)).with_version(2)).unwrap();
    assert_eq!(trunk.entry_count(), 1);
    let nut = trunk.crack("k").unwrap().unwrap();
    assert_eq!(nut.payload, json!(2));
    assert_eq!(nut.version, 2);
}

#[test]
fn toss_removes_across_restart() {
    let dir = tempdir().unwrap();
    {
        let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
        trunk.stash("stay", &Nut::new("stay", json!(1))).unwrap();
        trunk.stash("go", &Nut::new("go", json!(2))).unwrap();
        trunk.toss("go").unwrap();
        assert_eq!(trunk.entry_count(), 1);
        // Deleting an absent key is a quiet no-op.
        trunk.toss("never-there").unwrap();
    }
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    assert!(trunk.crack("go").unwrap().is_none());
    assert!(trunk.crack("stay").unwrap().is_some());
}

#[test]
fn emptying_the_tree_resets_the_root() {
    let dir = tempdir().unwrap();
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    for i in 0..50 {
        let key = format!("k{i:02}");
        trunk.stash(&key, &Nut::new(&key, json!(i))).unwrap();
    }
    for i in 0..50 {
        trunk.toss(&format!("k{i:02}")).unwrap();
    }
    assert_eq!(trunk.entry_count(), 0);
    assert!(trunk.crack_all().unwrap().is_empty());

    // The tree grows again from empty.
    trunk.stash("fresh", &Nut::new("fresh", json!("again"))).unwrap();
    assert_eq!(trunk.crack("fresh").unwrap().unwrap().payload, json!("again"));
}

#[test]
fn wal_recovery_restores_lost_data_pages() {
    let dir = tempdir().unwrap();
    let options = small_pages();
    {
        let trunk = BPlusTrunk::open_with(dir.path(), options.clone()).unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            trunk.stash(key, &Nut::new(key, json!({"k": key}))).unwrap();
        }
    }

    // Simulate a crash where the data-file writes never hit the platter but
    // the WAL (fsynced at each commit) survived: throw away every page
    // except the superblock.
    let data_path = dir.path().join(DATA_FILE_NAME);
    let file = std::fs::OpenOptions::new().write(true).open(&data_path).unwrap();
    file.set_len(options.page_size as u64).unwrap();
    drop(file);

    let trunk = BPlusTrunk::open_with(dir.path(), options).unwrap();
    for key in ["a", "b", "c", "d", "e"] {
        let nut = trunk.crack(key).unwrap().unwrap_or_else(|| panic!("missing {key}"));
        assert_eq!(nut.payload["k"], json!(key));
    }
}

#[test]
fn torn_wal_tail_keeps_the_pre_commit_state() {
    let dir = tempdir().unwrap();
    let options = small_pages();
    {
        let trunk = BPlusTrunk::open_with(dir.path(), options.clone()).unwrap();
        trunk.stash("committed", &Nut::new("committed", json!(true))).unwrap();
    }
    // A torn append: garbage that is not a whole WAL record.
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(WAL_FILE_NAME))
            .unwrap();
        file.write_all(&[0xAB; 100]).unwrap();
    }
    let trunk = BPlusTrunk::open_with(dir.path(), options).unwrap();
    assert_eq!(trunk.crack("committed").unwrap().unwrap().payload, json!(true));
}

#[test]
fn root_generation_is_monotonic() {
    let dir = tempdir().unwrap();
    let gen_after_writes;
    {
        let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
        trunk.stash("a", &Nut::new("a", json!(1))).unwrap();
        trunk.stash("b", &Nut::new("b", json!(2))).unwrap();
        gen_after_writes = trunk.root_generation();
        assert!(gen_after_writes >= 2);
    }
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    assert_eq!(trunk.root_generation(), gen_after_writes);
    trunk.stash("c", &Nut::new("c", json!(3))).unwrap();
    assert!(trunk.root_generation() > gen_after_writes);
}

#[test]
fn zero_entry_count_with_live_root_is_recounted() {
    let dir = tempdir().unwrap();
    let options = BPlusOptions { checkpoint_threshold: 1, ..small_pages() };
    {
        let trunk = BPlusTrunk::open_with(dir.path(), options.clone()).unwrap();
        for i in 0..20 {
            let key = format!("k{i:02}");
            trunk.stash(&key, &Nut::new(&key, json!(i))).unwrap();
        }
        assert_eq!(trunk.entry_count(), 20);
    }

    // Rewrite the superblock with a zero entry count, as an older format
    // that reused those bytes would leave behind.
    let data_path = dir.path().join(DATA_FILE_NAME);
    {
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut file =
            std::fs::OpenOptions::new().read(true).write(true).open(&data_path).unwrap();
        let mut head = [0u8; trunkdb::pager::SUPERBLOCK_LEN];
        file.read_exact(&mut head).unwrap();
        let mut sb = Superblock::decode(&head).unwrap();
        sb.entry_count = 0;
        let mut page = vec![0u8; 4096];
        sb.encode(&mut page);
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&page[..trunkdb::pager::SUPERBLOCK_LEN]).unwrap();
        file.sync_data().unwrap();
    }

    let trunk = BPlusTrunk::open_with(dir.path(), options).unwrap();
    assert_eq!(trunk.entry_count(), 20, "leaf walk must restore the count");
}

#[test]
fn page_corruption_raises_corrupted_page() {
    let dir = tempdir().unwrap();
    // Checkpoint on every commit so the WAL cannot repair the damage.
    let options = BPlusOptions { checkpoint_threshold: 1, ..small_pages() };
    {
        let trunk = BPlusTrunk::open_with(dir.path(), options.clone()).unwrap();
        trunk.stash("k", &Nut::new("k", json!("v"))).unwrap();
    }
    // Flip a byte in the root leaf's body (outside the CRC field).
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join(DATA_FILE_NAME))
            .unwrap();
        file.seek(SeekFrom::Start(4096 + 200)).unwrap();
        file.write_all(&[0xEE]).unwrap();
        file.sync_data().unwrap();
    }
    let trunk = BPlusTrunk::open_with(dir.path(), options).unwrap();
    match trunk.crack("k") {
        Err(TrunkError::CorruptedPage { page_id, .. }) => assert_eq!(page_id, 1),
        other => panic!("expected CorruptedPage, got {other:?}"),
    }
}

#[test]
fn pipeline_applies_to_tree_values() {
    use std::sync::Arc;
    use trunkdb::GzipRoot;

    let dir = tempdir().unwrap();
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    trunk.roots().add(Arc::new(GzipRoot::new()));
    let nut = Nut::new("z", json!({"deep": [1, 2, 3]}));
    trunk.stash("z", &nut).unwrap();
    assert_eq!(trunk.crack("z").unwrap().unwrap().payload, nut.payload);
}

#[test]
fn capabilities_and_history() {
    let dir = tempdir().unwrap();
    let trunk = BPlusTrunk::open(dir.path()).unwrap();
    let caps = trunk.capabilities();
    assert_eq!(caps.trunk_type, "bplustree");
    assert!(caps.is_durable);
    assert!(!caps.supports_history);
    assert!(matches!(trunk.get_history("k"), Err(TrunkError::NotSupported(_))));
}

#[test]
fn cache_serves_repeated_reads() {
    let dir = tempdir().unwrap();
    let trunk = BPlusTrunk::open_with(dir.path(), small_pages()).unwrap();
    trunk.stash("hot", &Nut::new("hot", json!(1))).unwrap();
    for _ in 0..10 {
        trunk.crack("hot").unwrap().unwrap();
    }
    let stats = trunk.cache_stats();
    assert!(stats.hits >= 9, "repeated point reads must hit the cache: {stats:?}");
}
