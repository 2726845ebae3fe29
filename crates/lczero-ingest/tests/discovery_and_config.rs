mod common;

use std::collections::HashSet;
use std::fs::File;
use std::time::{Duration, SystemTime};

use lczero_ingest::{
    ChunkRole, ConfigError, DatasetConfig, InputSpec, Pipeline, PipelineError, RecordMeta,
};
use tempfile::tempdir;

use common::*;

fn age(path: &std::path::Path, secs: u64) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(secs))
        .unwrap();
}

fn files_seen(pipeline: &mut Pipeline) -> HashSet<u32> {
    pipeline
        .by_ref()
        .flat_map(|b| b.into_records())
        .map(|r| id(&r).0)
        .collect()
}

#[test]
fn newest_chunks_are_retained() {
    let td = tempdir().unwrap();
    for f in 0..5u32 {
        let p = write_tagged(td.path(), &format!("c{f}.gz"), RecordMeta::V3, f, 3);
        // c4 が最新
        age(&p, 1000 - u64::from(f) * 100);
    }
    let mut cfg = config(td.path());
    cfg.source.num_chunks = Some(2);
    let mut pipeline = Pipeline::start(cfg).unwrap();
    assert_eq!(files_seen(&mut pipeline), HashSet::from([3, 4]));
}

#[test]
fn too_few_chunks_is_fatal_unless_allowed() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "only.gz", RecordMeta::V3, 1, 3);

    let mut cfg = config(td.path());
    cfg.source.num_chunks = Some(10);
    let err = Pipeline::start(cfg.clone()).err().unwrap();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::TooFewChunks {
            found: 1,
            requested: 10
        })
    ));

    cfg.source.allow_less_chunks = true;
    let mut pipeline = Pipeline::start(cfg).unwrap();
    assert_eq!(files_seen(&mut pipeline), HashSet::from([1]));
}

#[test]
fn overlapping_train_and_test_rejected_at_start() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "a.gz", RecordMeta::V3, 1, 3);

    let mut cfg = config(td.path());
    cfg.source.input = InputSpec::Split {
        train: vec![gz_pattern(td.path())],
        test: vec![td.path().join("a.gz").to_string_lossy().into_owned()],
    };
    let err = Pipeline::start(cfg).err().unwrap();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::OverlappingSplit { .. })
    ));
}

#[test]
fn toml_config_drives_train_and_test_pipelines() {
    let td = tempdir().unwrap();
    let data = td.path().join("data");
    std::fs::create_dir(&data).unwrap();
    for f in 0..10u32 {
        write_tagged(&data, &format!("training.{f:02}.gz"), RecordMeta::V3, f, 5);
    }

    let toml = format!(
        r#"
[dataset]
input = ["{}"]
train_ratio = 0.8
train_workers = 2
test_workers = 1

[training]
batch_size = 7
shuffle_size = 20
channel_capacity = 8
seed = 99
"#,
        data.display()
    );
    let cfg_path = td.path().join("lczero.toml");
    std::fs::write(&cfg_path, toml).unwrap();
    let cfg = DatasetConfig::from_file(&cfg_path).unwrap();

    let mut train = Pipeline::start(cfg.pipeline_config(ChunkRole::Train).unwrap()).unwrap();
    let mut test = Pipeline::start(cfg.pipeline_config(ChunkRole::Test).unwrap()).unwrap();
    let train_files = files_seen(&mut train);
    let test_files = files_seen(&mut test);

    assert_eq!(train_files, (0..8).collect::<HashSet<u32>>());
    assert_eq!(test_files, HashSet::from([8, 9]));
}

#[test]
fn same_seed_same_batches() {
    let td = tempdir().unwrap();
    // ワーカー1本なら到着順が決まるので、シード固定で出力も決まる
    for f in 0..3u32 {
        write_tagged(td.path(), &format!("{f}.gz"), RecordMeta::V3, f, 40);
    }
    let run = || {
        let mut cfg = config(td.path());
        cfg.workers = 1;
        cfg.source.shuffle_chunks = true;
        cfg.shuffle_capacity = 32;
        let pipeline = Pipeline::start(cfg).unwrap();
        pipeline
            .flat_map(|b| b.into_records())
            .map(|r| id(&r))
            .collect::<Vec<_>>()
    };
    let a = run();
    assert_eq!(a.len(), 120);
    assert_eq!(a, run());
}

#[test]
fn pool_ratio_leaving_train_empty_fails_start() {
    let td = tempdir().unwrap();
    write_tagged(td.path(), "only.gz", RecordMeta::V3, 1, 3);

    let mut cfg = config(td.path());
    cfg.source.input = InputSpec::Pool {
        patterns: vec![gz_pattern(td.path())],
        train_ratio: 0.9,
    };
    let err = Pipeline::start(cfg.clone()).err().unwrap();
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::EmptySplit {
            role: ChunkRole::Train,
            available: 1,
            ..
        })
    ));

    cfg.source.allow_less_chunks = true;
    let mut pipeline = Pipeline::start(cfg).unwrap();
    assert!(pipeline.next_batch().unwrap().is_none());
}

#[test]
fn validation_set_reads_its_own_patterns() {
    let td = tempdir().unwrap();
    let train = td.path().join("train");
    let val = td.path().join("val");
    std::fs::create_dir(&train).unwrap();
    std::fs::create_dir(&val).unwrap();
    for f in 0..3u32 {
        write_tagged(&train, &format!("t{f}.gz"), RecordMeta::V3, f, 4);
    }
    write_tagged(&val, "v.gz", RecordMeta::V3, 50, 6);

    let toml = format!(
        r#"
[dataset]
input_train = ["{}"]
input_test = ["{}"]
input_validation = ["{}"]
test_workers = 1

[training]
batch_size = 4
"#,
        gz_pattern(&train),
        train.join("t0.gz").display(),
        val.display()
    );
    // t0 は学習用と評価用の両方に入るので train/test は使えないが、検証用は独立
    let cfg = DatasetConfig::from_toml_str(&toml).unwrap();
    let vc = cfg.pipeline_config(ChunkRole::Validation).unwrap();
    assert_eq!(vc.shuffle_capacity, 1);
    assert_eq!(vc.workers, 1);

    let mut pipeline = Pipeline::start(vc).unwrap();
    let sizes: Vec<usize> = pipeline.by_ref().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![4, 2]);
    assert_eq!(pipeline.stats().chunks_read, 1);

    assert!(matches!(
        Pipeline::start(cfg.pipeline_config(ChunkRole::Train).unwrap()).err(),
        Some(PipelineError::Config(ConfigError::OverlappingSplit { .. }))
    ));
}
