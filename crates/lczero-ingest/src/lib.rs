//! lczero 学習チャンクの取り込みパイプライン
//!
//! gzip 圧縮された V3/V4/V5 形式のチャンクファイルを並列に復号し、
//! シャッフルバッファで順序を崩したうえで固定サイズのバッチとして供給する。
//!
//! ```rust,ignore
//! use lczero_ingest::{Pipeline, PipelineConfig};
//!
//! let mut pipeline = Pipeline::start(config)?;
//! while let Some(batch) = pipeline.next_batch()? {
//!     train_step(&batch.planes(), &batch.policy(), &batch.wdl());
//! }
//! pipeline.stop();
//! ```

pub mod batch;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod record;
pub mod shuffle;
pub mod source;
pub mod stats;
mod worker;

pub use batch::{Batch, BatchAssembler, RecordStream, ShuffledStream, StreamItem};
pub use cancel::CancelToken;
pub use codec::{decode, decode_checked, detect_version, encode, encode_into};
pub use config::{DatasetConfig, PipelineConfig};
pub use error::{
    ChunkErrorKind, ChunkReadError, ConfigError, DecodeError, MalformedRecord, PipelineError,
    VersionDetectError,
};
pub use io::{ChunkFile, ChunkWriter, Compression, write_chunk};
pub use pipeline::{Pipeline, StopHandle};
pub use record::{FormatVersion, InputFormat, Record, RecordMeta};
pub use shuffle::ShuffleBuffer;
pub use source::{ChunkRole, ChunkSource, ChunkSourceConfig, InputSpec};
pub use stats::{Diagnostic, PipelineStats, StatsSnapshot};
