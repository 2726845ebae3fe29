mod common;

use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use lczero_ingest::{
    Compression, Diagnostic, FormatVersion, InputFormat, Pipeline, PipelineError, Record,
    RecordMeta, write_chunk,
};
use tempfile::tempdir;

use common::*;

#[test]
fn two_files_three_workers_batches_everything_once() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "a.gz", v5_meta(InputFormat::CLASSIC), 1, 100);
    write_tagged(td.path(), "b.gz", v5_meta(InputFormat::CLASSIC), 2, 100);

    let mut cfg = config(td.path());
    cfg.workers = 3;
    cfg.shuffle_capacity = 50;
    cfg.batch_size = 32;
    let mut pipeline = Pipeline::start(cfg).unwrap();

    let mut sizes = Vec::new();
    let mut seen = HashSet::new();
    while let Some(batch) = pipeline.next_batch().unwrap() {
        sizes.push(batch.len());
        for r in batch.records() {
            assert!(seen.insert(id(r)), "duplicate record {:?}", id(r));
            assert_eq!(r.version(), FormatVersion::V5);
        }
    }
    assert_eq!(sizes, vec![32, 32, 32, 32, 32, 32, 8]);
    assert_eq!(seen.len(), 200);
    assert!(pipeline.next_batch().unwrap().is_none());

    let stats = pipeline.stats();
    assert_eq!(stats.chunks_read, 2);
    assert_eq!(stats.records_decoded, 200);
    assert_eq!(stats.chunks_skipped, 0);
}

#[test]
fn shuffle_mixes_files() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "a.gz", RecordMeta::V3, 1, 300);
    write_tagged(td.path(), "b.gz", RecordMeta::V3, 2, 300);

    let mut cfg = config(td.path());
    cfg.shuffle_capacity = 200;
    cfg.batch_size = 600;
    let mut pipeline = Pipeline::start(cfg).unwrap();
    let batch = pipeline.next_batch().unwrap().unwrap();
    assert_eq!(batch.len(), 600);

    // 入力順のままなら隣接ペアはほぼすべて連番になる
    let ids: Vec<(u32, u32)> = batch.records().iter().map(id).collect();
    let consecutive = ids
        .windows(2)
        .filter(|w| w[0].0 == w[1].0 && w[1].1 == w[0].1 + 1)
        .count();
    assert!(consecutive < 100, "consecutive pairs: {consecutive}");
}

#[test]
fn zero_shuffle_capacity_preserves_file_order() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "only.gz", RecordMeta::V3, 7, 50);

    let mut cfg = config(td.path());
    cfg.workers = 1;
    cfg.shuffle_capacity = 0;
    cfg.batch_size = 50;
    let mut pipeline = Pipeline::start(cfg).unwrap();
    let batch = pipeline.next_batch().unwrap().unwrap();
    let order: Vec<u32> = batch.records().iter().map(|r| id(r).1).collect();
    assert_eq!(order, (0..50).collect::<Vec<_>>());
}

#[test]
fn corrupt_file_is_skipped_and_reported() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "good.gz", RecordMeta::V4 { q: Default::default() }, 1, 100);
    let bad = td.path().join("bad.gz");
    let noise: Vec<u8> = (0..5000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 7) as u8).collect();
    std::fs::write(&bad, noise).unwrap();

    let mut pipeline = Pipeline::start(config(td.path())).unwrap();
    let total: usize = pipeline.by_ref().map(|b| b.len()).sum();
    assert_eq!(total, 100);

    let stats = pipeline.stats();
    assert_eq!(stats.chunks_skipped, 1);
    assert_eq!(stats.chunks_read, 1);
    let diags = pipeline.take_diagnostics();
    assert!(
        diags
            .iter()
            .any(|d| matches!(d, Diagnostic::ChunkSkipped { path, .. } if *path == bad)),
        "{diags:?}"
    );
}

#[test]
fn malformed_records_are_dropped() {
    let td = tempdir().unwrap();
    let mut records: Vec<Record> = (0..20).map(|i| tagged(RecordMeta::V3, 1, i)).collect();
    records[5].probabilities[0] = f32::NAN;
    records[11].probabilities[9] = f32::INFINITY;
    write_chunk(td.path().join("c.gz"), &records, Compression::Gzip).unwrap();

    let mut pipeline = Pipeline::start(config(td.path())).unwrap();
    let ids: HashSet<u32> = pipeline
        .by_ref()
        .flat_map(|b| b.into_records())
        .map(|r| id(&r).1)
        .collect();
    assert_eq!(ids.len(), 18);
    assert!(!ids.contains(&5) && !ids.contains(&11));

    let stats = pipeline.stats();
    assert_eq!(stats.records_dropped, 2);
    assert_eq!(stats.chunks_read, 1);
    let dropped = pipeline
        .take_diagnostics()
        .into_iter()
        .filter(|d| matches!(d, Diagnostic::RecordDropped { .. }))
        .count();
    assert_eq!(dropped, 2);
}

#[test]
fn input_format_mismatch_drops_records() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "classic.gz", v5_meta(InputFormat::CLASSIC), 1, 30);
    write_tagged(td.path(), "canon.gz", v5_meta(InputFormat::CANONICAL), 2, 30);

    let mut cfg = config(td.path());
    cfg.expected_input_format = Some(InputFormat::CLASSIC);
    let mut pipeline = Pipeline::start(cfg).unwrap();
    let files: HashSet<u32> = pipeline
        .by_ref()
        .flat_map(|b| b.into_records())
        .map(|r| id(&r).0)
        .collect();
    assert_eq!(files, HashSet::from([1]));
    assert_eq!(pipeline.stats().records_dropped, 30);
}

#[test]
fn mixed_versions_are_detected_per_file() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "v3.gz", RecordMeta::V3, 3, 17);
    write_tagged(td.path(), "v4.gz", RecordMeta::V4 { q: Default::default() }, 4, 23);
    write_tagged(td.path(), "v5.gz", v5_meta(InputFormat::CANONICAL_V2), 5, 31);

    let mut pipeline = Pipeline::start(config(td.path())).unwrap();
    let mut per_file = [0usize; 6];
    for batch in pipeline.by_ref() {
        for r in batch.records() {
            let (file, _) = id(r);
            assert_eq!(r.version().tag(), file);
            per_file[file as usize] += 1;
        }
    }
    assert_eq!(&per_file[3..], &[17, 23, 31]);
}

#[test]
fn explicit_version_skips_other_layouts() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "v3.gz", RecordMeta::V3, 3, 10);
    write_tagged(td.path(), "v5.gz", v5_meta(InputFormat::CLASSIC), 5, 10);

    let mut cfg = config(td.path());
    cfg.version = Some(FormatVersion::V5);
    let mut pipeline = Pipeline::start(cfg).unwrap();
    let total: usize = pipeline.by_ref().map(|b| b.len()).sum();
    assert_eq!(total, 10);
    assert_eq!(pipeline.stats().chunks_skipped, 1);
}

#[test]
fn all_files_bad_ends_without_batches() {
    let td = tempdir().unwrap();
    std::fs::write(td.path().join("empty.gz"), b"").unwrap();
    std::fs::write(td.path().join("junk.gz"), [1u8; 1000]).unwrap();

    let mut pipeline = Pipeline::start(config(td.path())).unwrap();
    assert!(pipeline.next_batch().unwrap().is_none());
    assert_eq!(pipeline.stats().chunks_skipped, 2);
}

#[test]
fn stop_handle_unblocks_waiting_consumer() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "a.gz", RecordMeta::V3, 1, 10);

    // 連続モードでは入力が尽きても終わらないので、コンシューマは待ち続ける
    let mut cfg = config(td.path());
    cfg.shuffle_capacity = 1000;
    cfg.source.rescan_interval = Some(Duration::from_secs(3600));
    let mut pipeline = Pipeline::start(cfg).unwrap();
    let handle = pipeline.stop_handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        handle.stop();
        Instant::now()
    });
    let result = pipeline.next_batch();
    let returned = Instant::now();
    let stopped_at = stopper.join().unwrap();

    assert!(matches!(result, Err(PipelineError::Shutdown)));
    assert!(returned.duration_since(stopped_at) < Duration::from_secs(1));

    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn stop_with_blocked_workers_returns_promptly() {
    let td = tempdir().unwrap();
    for f in 0..3 {
        write_tagged(td.path(), &format!("{f}.gz"), RecordMeta::V3, f, 500);
    }
    let mut cfg = config(td.path());
    cfg.workers = 3;
    cfg.channel_capacity = 2;
    cfg.shuffle_capacity = 0;
    cfg.batch_size = 4;
    let mut pipeline = Pipeline::start(cfg).unwrap();
    assert_eq!(pipeline.next_batch().unwrap().unwrap().len(), 4);

    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(pipeline.next_batch().unwrap_err().is_shutdown());
    assert_eq!(pipeline.buffered(), 0);
}

#[test]
fn rescan_picks_up_new_chunks() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "first.gz", RecordMeta::V3, 1, 4);

    let mut cfg = config(td.path());
    cfg.workers = 1;
    cfg.shuffle_capacity = 0;
    cfg.batch_size = 1;
    cfg.source.rescan_interval = Some(Duration::from_millis(100));
    let mut pipeline = Pipeline::start(cfg).unwrap();

    let watchdog = pipeline.stop_handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(20));
        watchdog.stop();
    });

    let first = pipeline.next_batch().unwrap().unwrap();
    assert_eq!(id(&first.records()[0]).0, 1);
    write_tagged(td.path(), "second.gz", RecordMeta::V3, 2, 4);

    let mut saw_second = false;
    while let Ok(Some(batch)) = pipeline.next_batch() {
        if id(&batch.records()[0]).0 == 2 {
            saw_second = true;
            break;
        }
    }
    assert!(saw_second);
    assert!(pipeline.stats().discoveries >= 2);
}

#[test]
fn slow_consumer_still_reaches_oldest_chunks_in_continuous_mode() {
    let td = tempdir().unwrap();
    for f in 0..8u32 {
        let p = write_tagged(td.path(), &format!("c{f}.gz"), RecordMeta::V3, f, 5);
        // c7 が最新
        std::fs::File::options()
            .write(true)
            .open(&p)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(1000 - u64::from(f) * 100))
            .unwrap();
    }

    let mut cfg = config(td.path());
    cfg.workers = 1;
    cfg.channel_capacity = 1;
    cfg.shuffle_capacity = 0;
    cfg.batch_size = 1;
    cfg.source.rescan_interval = Some(Duration::from_millis(100));
    let mut pipeline = Pipeline::start(cfg).unwrap();

    // 1パスに探索間隔の数倍かかる遅さで読む
    let mut seen = HashSet::new();
    for _ in 0..40 {
        let batch = pipeline.next_batch().unwrap().unwrap();
        seen.insert(id(&batch.records()[0]).0);
        thread::sleep(Duration::from_millis(20));
    }
    pipeline.stop();
    assert_eq!(seen, (0..8).collect::<HashSet<u32>>());
}

#[test]
fn legal_masks_follow_policy() {
    let td = tempdir().unwrap();
    let mut records: Vec<Record> = (0..4).map(|i| tagged(RecordMeta::V3, 1, i)).collect();
    for r in &mut records {
        r.probabilities.fill(-1.0);
        r.probabilities[42] = 1.0;
    }
    write_chunk(td.path().join("m.gz"), &records, Compression::Gzip).unwrap();

    let mut cfg = config(td.path());
    cfg.propagate_legal_mask = true;
    cfg.batch_size = 4;
    let mut pipeline = Pipeline::start(cfg).unwrap();
    let batch = pipeline.next_batch().unwrap().unwrap();
    let masks = batch.legal_masks().unwrap();
    assert_eq!(masks.len(), 4);
    for m in masks {
        assert_eq!(m.iter().filter(|&&b| b).count(), 1);
        assert!(m[42]);
    }
}
