use tempfile::tempdir;
use trunkdb::wal::WalManager;

const PS: usize = 4096;

fn image(byte: u8) -> Vec<u8> {
    vec![byte; PS]
}

#[test]
fn append_then_replay_in_order() {
    let dir = tempdir().unwrap();
    let wal = WalManager::open(&dir.path().join("t.wal"), PS).unwrap();
    wal.append(1, &image(0x11)).unwrap();
    wal.append(2, &image(0x22)).unwrap();
    wal.append(1, &image(0x33)).unwrap();
    wal.sync().unwrap();
    assert_eq!(wal.entries_since_checkpoint(), 3);

    let mut seen = Vec::new();
    let replayed = wal
        .replay(|page_id, img| {
            seen.push((page_id, img[0]));
            Ok(())
        })
        .unwrap();
    assert_eq!(replayed, 3);
    assert_eq!(seen, vec![(1, 0x11), (2, 0x22), (1, 0x33)]);
}

#[test]
fn entry_counter_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");
    {
        let wal = WalManager::open(&path, PS).unwrap();
        wal.append(5, &image(5)).unwrap();
        wal.append(6, &image(6)).unwrap();
        wal.sync().unwrap();
    }
    let wal = WalManager::open(&path, PS).unwrap();
    assert_eq!(wal.entries_since_checkpoint(), 2);
    assert!(!wal.is_empty());
}

#[test]
fn torn_tail_stops_replay() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");
    let wal = WalManager::open(&path, PS).unwrap();
    wal.append(1, &image(1)).unwrap();
    wal.append(2, &image(2)).unwrap();
    wal.sync().unwrap();
    drop(wal);

    // Chop the second record in half: a crash mid-append.
    let record_len = 8 + PS as u64 + 4;
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(record_len + record_len / 2).unwrap();
    drop(file);

    let wal = WalManager::open(&path, PS).unwrap();
    let mut seen = Vec::new();
    let replayed = wal
        .replay(|page_id, _| {
            seen.push(page_id);
            Ok(())
        })
        .unwrap();
    assert_eq!(replayed, 1);
    assert_eq!(seen, vec![1]);
}

#[test]
fn corrupt_record_stops_replay() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");
    let wal = WalManager::open(&path, PS).unwrap();
    wal.append(1, &image(1)).unwrap();
    wal.append(2, &image(2)).unwrap();
    wal.append(3, &image(3)).unwrap();
    wal.sync().unwrap();
    drop(wal);

    // Flip a byte inside the second record's image.
    {
        use std::io::{Seek, SeekFrom, Write};
        let record_len = 8 + PS as u64 + 4;
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(record_len + 8 + 100)).unwrap();
        file.write_all(&[0xFF]).unwrap();
    }

    let wal = WalManager::open(&path, PS).unwrap();
    let replayed = wal.replay(|_, _| Ok(())).unwrap();
    assert_eq!(replayed, 1, "replay must stop at the first invalid CRC");
}

#[test]
fn truncate_resets_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.wal");
    let wal = WalManager::open(&path, PS).unwrap();
    wal.append(1, &image(1)).unwrap();
    wal.truncate().unwrap();
    assert!(wal.is_empty());
    assert_eq!(wal.entries_since_checkpoint(), 0);
    assert_eq!(wal.replay(|_, _| Ok(())).unwrap(), 0);

    // The log is append-ready again after a truncate.
    wal.append(9, &image(9)).unwrap();
    assert_eq!(wal.entries_since_checkpoint(), 1);
}
