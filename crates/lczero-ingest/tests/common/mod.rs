#![allow(dead_code)]

use std::path::{Path, PathBuf};

use lczero_ingest::record::{MovesLeft, SearchQ};
use lczero_ingest::{
    Compression, InputFormat, InputSpec, PipelineConfig, Record, RecordMeta, write_chunk,
};

/// `planes[0]` にファイル番号とレコード番号を埋め込む
pub fn tagged(meta: RecordMeta, file: u32, index: u32) -> Record {
    let mut r = Record::zeroed(meta);
    r.planes[0] = (u64::from(file) << 32) | u64::from(index);
    r.probabilities[(index as usize) % 1858] = 1.0;
    r.result = [1, 0, -1][(index % 3) as usize];
    r
}

pub fn id(r: &Record) -> (u32, u32) {
    ((r.planes[0] >> 32) as u32, r.planes[0] as u32)
}

pub fn v5_meta(input_format: InputFormat) -> RecordMeta {
    RecordMeta::V5 {
        input_format,
        q: SearchQ {
            root_q: 0.1,
            best_q: 0.2,
            root_d: 0.3,
            best_d: 0.3,
        },
        m: MovesLeft {
            root_m: 10.0,
            best_m: 11.0,
            plies_left: 12.0,
        },
    }
}

pub fn write_tagged(dir: &Path, name: &str, meta: RecordMeta, file: u32, n: u32) -> PathBuf {
    let path = dir.join(name);
    let records: Vec<Record> = (0..n).map(|i| tagged(meta, file, i)).collect();
    write_chunk(&path, &records, Compression::Gzip).unwrap();
    path
}

pub fn gz_pattern(dir: &Path) -> String {
    dir.join("*.gz").to_string_lossy().into_owned()
}

pub fn config(dir: &Path) -> PipelineConfig {
    let mut c = PipelineConfig::new(InputSpec::Split {
        train: vec![gz_pattern(dir)],
        test: vec![],
    });
    c.workers = 2;
    c.channel_capacity = 16;
    c.shuffle_capacity = 16;
    c.batch_size = 8;
    c.seed = Some(1234);
    c
}
