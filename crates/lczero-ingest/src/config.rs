//! パイプライン設定
//!
//! `DatasetConfig` は TOML ファイルの `[dataset]` / `[training]` セクションをそのまま表し、
//! `pipeline_config(role)` で学習用・評価用それぞれの `PipelineConfig` に変換する。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::record::{FormatVersion, InputFormat};
use crate::source::{ChunkRole, ChunkSourceConfig, InputSpec};

pub const DEFAULT_TRAIN_RATIO: f64 = 0.9;
pub const DEFAULT_BATCH_SIZE: usize = 1024;
pub const DEFAULT_SHUFFLE_SIZE: usize = 250_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn default_test_workers() -> usize {
    1
}

fn default_train_ratio() -> f64 {
    DEFAULT_TRAIN_RATIO
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_shuffle_size() -> usize {
    DEFAULT_SHUFFLE_SIZE
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn yes() -> bool {
    true
}

/// `[dataset]` セクション
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSection {
    #[serde(default)]
    pub input_train: Vec<String>,
    #[serde(default)]
    pub input_test: Vec<String>,
    /// 単一プール指定（`input_train` / `input_test` とは排他）
    #[serde(default)]
    pub input: Vec<String>,
    /// 任意の検証用セット（評価用と同じく `test_workers`・シャッフルなしで読む）
    #[serde(default)]
    pub input_validation: Vec<String>,
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    #[serde(default)]
    pub num_chunks: Option<usize>,
    #[serde(default)]
    pub allow_less_chunks: bool,
    #[serde(default = "default_workers")]
    pub train_workers: usize,
    #[serde(default = "default_test_workers")]
    pub test_workers: usize,
    #[serde(default)]
    pub shuffle_chunks: bool,
    #[serde(default)]
    pub rescan_interval_secs: Option<u64>,
    #[serde(default)]
    pub format_version: Option<FormatVersion>,
    /// V5 の入力形式名（"classic", "canonical_v2" など）
    #[serde(default)]
    pub input_type: Option<String>,
}

/// `[training]` セクション
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_shuffle_size")]
    pub shuffle_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub propagate_legal_mask: bool,
    #[serde(default = "yes")]
    pub drain_on_exhaustion: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            shuffle_size: DEFAULT_SHUFFLE_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            propagate_legal_mask: false,
            drain_on_exhaustion: true,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub dataset: DatasetSection,
    #[serde(default)]
    pub training: TrainingSection,
}

impl DatasetConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data)
    }

    fn input_spec(&self) -> Result<InputSpec, ConfigError> {
        let d = &self.dataset;
        let split = !d.input_train.is_empty() || !d.input_test.is_empty();
        match (split, d.input.is_empty()) {
            (true, true) => Ok(InputSpec::Split {
                train: d.input_train.clone(),
                test: d.input_test.clone(),
            }),
            (false, false) => Ok(InputSpec::Pool {
                patterns: d.input.clone(),
                train_ratio: d.train_ratio,
            }),
            (true, false) => Err(ConfigError::invalid(
                "input",
                "use either `input` or `input_train`/`input_test`, not both",
            )),
            (false, true) => Err(ConfigError::invalid("input", "no input patterns given")),
        }
    }

    /// 役割ごとの検証済み設定を作る
    ///
    /// 評価用と検証用は `test_workers` を使い、シャッフルバッファは容量 1（実質素通し）。
    pub fn pipeline_config(&self, role: ChunkRole) -> Result<PipelineConfig, ConfigError> {
        let d = &self.dataset;
        let t = &self.training;
        let expected_input_format = d
            .input_type
            .as_deref()
            .map(InputFormat::from_name)
            .transpose()?;

        let (workers, shuffle_capacity) = match role {
            ChunkRole::Train => (d.train_workers, t.shuffle_size),
            ChunkRole::Test | ChunkRole::Validation => (d.test_workers, 1),
        };

        let config = PipelineConfig {
            source: ChunkSourceConfig {
                input: self.input_spec()?,
                validation: d.input_validation.clone(),
                num_chunks: d.num_chunks,
                allow_less_chunks: d.allow_less_chunks,
                shuffle_chunks: d.shuffle_chunks,
                rescan_interval: d.rescan_interval_secs.map(Duration::from_secs),
            },
            role,
            workers,
            channel_capacity: t.channel_capacity,
            shuffle_capacity,
            batch_size: t.batch_size,
            propagate_legal_mask: t.propagate_legal_mask,
            version: d.format_version,
            expected_input_format,
            drain_on_exhaustion: t.drain_on_exhaustion,
            seed: t.seed,
        };
        config.validate()?;
        Ok(config)
    }
}

/// `Pipeline::start` に渡す設定
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub source: ChunkSourceConfig,
    pub role: ChunkRole,
    /// デコードワーカー数
    pub workers: usize,
    /// ワーカー→コンシューマ間のチャネル容量（レコード数）
    pub channel_capacity: usize,
    /// 0 ならシャッフルなし
    pub shuffle_capacity: usize,
    pub batch_size: usize,
    pub propagate_legal_mask: bool,
    /// None なら各ファイルの長さから推定する
    pub version: Option<FormatVersion>,
    pub expected_input_format: Option<InputFormat>,
    /// 入力が尽きたらシャッフルバッファの残りを吐き出すか
    pub drain_on_exhaustion: bool,
    pub seed: Option<u64>,
}

impl PipelineConfig {
    /// 既定値で埋めた学習用設定
    pub fn new(input: InputSpec) -> Self {
        Self {
            source: ChunkSourceConfig {
                input,
                validation: Vec::new(),
                num_chunks: None,
                allow_less_chunks: false,
                shuffle_chunks: false,
                rescan_interval: None,
            },
            role: ChunkRole::Train,
            workers: default_workers(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            shuffle_capacity: DEFAULT_SHUFFLE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            propagate_legal_mask: false,
            version: None,
            expected_input_format: None,
            drain_on_exhaustion: true,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::invalid("channel_capacity", "must be at least 1"));
        }
        if self.source.num_chunks == Some(0) {
            return Err(ConfigError::invalid("num_chunks", "must be at least 1"));
        }
        if self.source.rescan_interval == Some(Duration::ZERO) {
            return Err(ConfigError::invalid("rescan_interval", "must be positive"));
        }
        match &self.source.input {
            _ if self.role == ChunkRole::Validation => {
                if self.source.validation.is_empty() {
                    return Err(ConfigError::invalid(
                        "input_validation",
                        "no validation patterns given",
                    ));
                }
            }
            InputSpec::Split { train, test } => {
                let patterns = match self.role {
                    ChunkRole::Train => train,
                    ChunkRole::Test | ChunkRole::Validation => test,
                };
                if patterns.is_empty() {
                    return Err(ConfigError::invalid(
                        "input",
                        format!("no {:?} patterns given", self.role),
                    ));
                }
            }
            InputSpec::Pool {
                patterns,
                train_ratio,
            } => {
                if patterns.is_empty() {
                    return Err(ConfigError::invalid("input", "no input patterns given"));
                }
                if !(0.0..=1.0).contains(train_ratio) {
                    return Err(ConfigError::invalid(
                        "train_ratio",
                        format!("{train_ratio} is outside [0, 1]"),
                    ));
                }
            }
        }
        Ok(())
    }
}
