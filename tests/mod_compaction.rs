use serde_json::json;
use tempfile::tempdir;
use trunkdb::bitcask::BitcaskTrunk;
use trunkdb::{BitcaskOptions, CompactionOptions, Nut, Trunk};

fn manual_options() -> BitcaskOptions {
    BitcaskOptions {
        compaction: CompactionOptions::manual_only(),
        ..BitcaskOptions::default()
    }
}

#[test]
fn compaction_preserves_liveness() {
    let dir = tempdir().unwrap();
    let trunk = BitcaskTrunk::open_with(dir.path(), manual_options()).unwrap();
    for i in 0..100 {
        let key = format!("k{i:03}");
        trunk.stash(&key, &Nut::new(&key, json!({"i": i})).with_version(i)).unwrap();
    }
    for i in 0..50 {
        let key = format!("k{i:03}");
        trunk.stash(&key, &Nut::new(&key, json!({"i": i, "r": 2})).with_version(100 + i)).unwrap();
    }
    for i in 90..100 {
        trunk.toss(&format!("k{i:03}")).unwrap();
    }
    trunk.flush().unwrap();

    let before = trunk.crack_all().unwrap();
    let size_before = trunk.stats().logical_size;
    trunk.compact().unwrap();
    let after = trunk.crack_all().unwrap();

    assert_eq!(before.len(), 90);
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.key, a.key);
        assert_eq!(b.payload, a.payload);
        assert_eq!(b.version, a.version);
        assert_eq!(b.timestamp.timestamp_micros(), a.timestamp.timestamp_micros());
    }

    let stats = trunk.stats();
    assert_eq!(stats.dead_records, 0);
    assert_eq!(stats.mutations_since_compaction, 0);
    assert_eq!(stats.total_records, 90);
    assert!(stats.logical_size < size_before);
}

#[test]
fn compaction_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let trunk = BitcaskTrunk::open_with(dir.path(), manual_options()).unwrap();
        trunk.stash("a", &Nut::new("a", json!(1))).unwrap();
        trunk.stash("a", &Nut::new("a", json!(2)).with_version(2)).unwrap();
        trunk.stash("b", &Nut::new("b", json!(3))).unwrap();
        trunk.toss("b").unwrap();
        trunk.compact().unwrap();
    }
    let trunk = BitcaskTrunk::open_with(dir.path(), manual_options()).unwrap();
    assert_eq!(trunk.crack("a").unwrap().unwrap().payload, json!(2));
    assert!(trunk.crack("b").unwrap().is_none());
    let stats = trunk.stats();
    assert_eq!(stats.total_records, 1);
    assert_eq!(stats.dead_records, 0);
}

#[test]
fn tombstones_do_not_resurrect_after_compaction() {
    let dir = tempdir().unwrap();
    {
        let trunk = BitcaskTrunk::open_with(dir.path(), manual_options()).unwrap();
        trunk.stash("gone", &Nut::new("gone", json!("x"))).unwrap();
        trunk.flush().unwrap();
        trunk.toss("gone").unwrap();
        trunk.compact().unwrap();
    }
    let trunk = BitcaskTrunk::open_with(dir.path(), manual_options()).unwrap();
    assert!(trunk.crack("gone").unwrap().is_none());
}

#[test]
fn auto_compaction_bounds_file_growth() {
    let dir = tempdir().unwrap();
    let options = BitcaskOptions {
        compaction: CompactionOptions {
            dead_space_ratio_threshold: 0.5,
            dead_record_count_threshold: u64::MAX,
            minimum_file_size_bytes: 16 * 1024,
            ..CompactionOptions::default()
        },
        ..BitcaskOptions::default()
    };
    let trunk = BitcaskTrunk::open_with(dir.path(), options).unwrap();

    let mut max_size = 0u64;
    for i in 0..10_000u32 {
        trunk.stash("hot", &Nut::new("hot", json!({"i": i})).with_version(i)).unwrap();
        max_size = max_size.max(trunk.stats().logical_size);
        // No reader ever observes a missing or stale value mid-compaction.
        let seen = trunk.crack("hot").unwrap().unwrap();
        assert_eq!(seen.version, i);
    }
    trunk.flush().unwrap();

    // The file stabilises instead of growing without bound: 10k overwrites of
    // a ~100-byte record would otherwise exceed a megabyte.
    assert!(max_size < 512 * 1024, "file grew to {max_size} bytes");
    let stats = trunk.stats();
    assert!(stats.dead_records < 10_000);
    assert_eq!(trunk.crack("hot").unwrap().unwrap().payload["i"], json!(9_999));
}

#[test]
fn compaction_upgrades_legacy_records_to_v2() {
    use trunkdb::bitcask::DATA_FILE_NAME;
    use trunkdb::bitcask::record::{MAGIC_V1, MAGIC_V2};
    use trunkdb::{JsonSerializer, NutSerializer};

    let dir = tempdir().unwrap();
    let path = dir.path().join(DATA_FILE_NAME);
    let envelope = JsonSerializer
        .serialize(&Nut::new("old", json!({"from": "v1"})))
        .unwrap();
    let mut data = Vec::new();
    data.extend_from_slice(&MAGIC_V1);
    data.extend_from_slice(&9u32.to_le_bytes());
    data.extend_from_slice(&1_500_000_000_000_000i64.to_le_bytes());
    data.extend_from_slice(&(envelope.len() as u32).to_le_bytes());
    data.extend_from_slice(b"old\0");
    data.extend_from_slice(&envelope);
    std::fs::write(&path, &data).unwrap();

    let trunk = BitcaskTrunk::open_with(dir.path(), manual_options()).unwrap();
    assert_eq!(trunk.crack("old").unwrap().unwrap().version, 9);
    trunk.compact().unwrap();

    // The rewritten file leads with a v2 record and the read still works.
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[..4], &MAGIC_V2[..]);
    let nut = trunk.crack("old").unwrap().unwrap();
    assert_eq!(nut.payload, json!({"from": "v1"}));
    assert_eq!(nut.version, 9);
    assert_eq!(nut.timestamp.timestamp_micros(), 1_500_000_000_000_000);
}

#[test]
fn manual_mode_never_compacts_on_its_own() {
    let dir = tempdir().unwrap();
    let options = BitcaskOptions {
        compaction: CompactionOptions {
            manual: true,
            dead_space_ratio_threshold: 0.01,
            dead_record_count_threshold: 1,
            minimum_file_size_bytes: 0,
            ..CompactionOptions::default()
        },
        ..BitcaskOptions::default()
    };
    let trunk = BitcaskTrunk::open_with(dir.path(), options).unwrap();
    for i in 0..100 {
        trunk.stash("k", &Nut::new("k", json!(i))).unwrap();
    }
    trunk.flush().unwrap();
    assert_eq!(trunk.stats().dead_records, 99);
    trunk.compact().unwrap();
    assert_eq!(trunk.stats().dead_records, 0);
}
