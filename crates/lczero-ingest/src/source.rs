//! チャンクファイルの探索
//!
//! glob パターン（ディレクトリ指定時は `<dir>/*.gz`）からチャンクを集め、
//! 更新日時の新しい順に `num_chunks` 件を残す。学習用／評価用の分割は
//! 別パターンで与えるか、単一プールを `train_ratio` で分ける。
//!
//! 探索は長時間の学習中に何度も呼び直され、新しく書き出されたチャンクを拾う。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::ConfigError;

/// 学習用・評価用・検証用のどれか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkRole {
    Train,
    Test,
    /// 任意の検証用セット。`validation` パターンから探し、評価用と同じ設定で読む
    Validation,
}

/// 入力パターンの与え方
#[derive(Debug, Clone, PartialEq)]
pub enum InputSpec {
    /// 学習用・評価用を別パターンで指定（重複は設定エラー）
    Split {
        train: Vec<String>,
        test: Vec<String>,
    },
    /// 単一プールをパス順に並べ、先頭 `train_ratio` を学習用にする
    Pool {
        patterns: Vec<String>,
        train_ratio: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSourceConfig {
    pub input: InputSpec,
    /// 検証用セットのパターン（`input` とは独立）
    pub validation: Vec<String>,
    /// 学習用に残すチャンク数（新しい順）
    pub num_chunks: Option<usize>,
    pub allow_less_chunks: bool,
    /// false なら新しい順、true ならシャッフル順で供給する
    pub shuffle_chunks: bool,
    /// 再探索の間隔。None なら1パスで1エポック
    pub rescan_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
struct Found {
    path: PathBuf,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ChunkSource {
    config: ChunkSourceConfig,
    role: ChunkRole,
}

impl ChunkSource {
    pub fn new(config: ChunkSourceConfig, role: ChunkRole) -> Self {
        Self { config, role }
    }

    pub fn role(&self) -> ChunkRole {
        self.role
    }

    pub fn config(&self) -> &ChunkSourceConfig {
        &self.config
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        self.config.rescan_interval
    }

    /// 1エポック分のチャンクパスを返す
    pub fn discover<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<PathBuf>, ConfigError> {
        let mut selected = match &self.config.input {
            _ if self.role == ChunkRole::Validation => {
                let patterns = &self.config.validation;
                self.retain_newest(expand_patterns(patterns)?, patterns, None)?
            }
            InputSpec::Split { train, test } => {
                let train_found = expand_patterns(train)?;
                let test_found = expand_patterns(test)?;
                check_disjoint(&train_found, &test_found)?;
                match self.role {
                    ChunkRole::Train => {
                        self.retain_newest(train_found, train, self.config.num_chunks)?
                    }
                    ChunkRole::Test | ChunkRole::Validation => {
                        self.retain_newest(test_found, test, None)?
                    }
                }
            }
            InputSpec::Pool {
                patterns,
                train_ratio,
            } => {
                if !(0.0..=1.0).contains(train_ratio) {
                    return Err(ConfigError::invalid(
                        "train_ratio",
                        format!("{train_ratio} is outside [0, 1]"),
                    ));
                }
                let found = expand_patterns(patterns)?;
                let mut pool = self.retain_newest(found, patterns, self.config.num_chunks)?;
                pool.sort_by(|a, b| a.path.cmp(&b.path));
                let available = pool.len();
                let split = (available as f64 * train_ratio) as usize;
                let test = pool.split_off(split.min(available));
                let part = match self.role {
                    ChunkRole::Train => pool,
                    ChunkRole::Test | ChunkRole::Validation => test,
                };
                // 比率で片側が空になった
                if part.is_empty() && available > 0 && !self.config.allow_less_chunks {
                    return Err(ConfigError::EmptySplit {
                        role: self.role,
                        available,
                        train_ratio: *train_ratio,
                    });
                }
                part
            }
        };

        if selected.is_empty() {
            log::warn!("no {:?} chunks selected", self.role);
        }

        newest_first(&mut selected);
        let mut paths: Vec<PathBuf> = selected.into_iter().map(|f| f.path).collect();
        if self.config.shuffle_chunks {
            paths.shuffle(rng);
        }
        log::info!("Found {} {:?} chunk files", paths.len(), self.role);
        Ok(paths)
    }

    fn retain_newest(
        &self,
        mut found: Vec<Found>,
        patterns: &[String],
        num_chunks: Option<usize>,
    ) -> Result<Vec<Found>, ConfigError> {
        let allow_less = self.config.allow_less_chunks;
        if found.is_empty() && !allow_less {
            return Err(ConfigError::NoChunks {
                patterns: patterns.to_vec(),
            });
        }
        let Some(requested) = num_chunks else {
            return Ok(found);
        };
        if found.len() < requested {
            if !allow_less {
                return Err(ConfigError::TooFewChunks {
                    found: found.len(),
                    requested,
                });
            }
            log::warn!(
                "Found {} chunks, requested {requested}. Proceeding with available chunks.",
                found.len()
            );
            return Ok(found);
        }
        newest_first(&mut found);
        found.truncate(requested);
        Ok(found)
    }
}

fn newest_first(files: &mut [Found]) {
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
}

fn check_disjoint(train: &[Found], test: &[Found]) -> Result<(), ConfigError> {
    let train_set: BTreeSet<&Path> = train.iter().map(|f| f.path.as_path()).collect();
    match test.iter().find(|f| train_set.contains(f.path.as_path())) {
        Some(f) => Err(ConfigError::OverlappingSplit {
            path: f.path.clone(),
        }),
        None => Ok(()),
    }
}

/// パターンを展開してファイルだけを集める（重複除去済み）
fn expand_patterns(patterns: &[String]) -> Result<Vec<Found>, ConfigError> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();

    for pattern in patterns {
        let pattern = if Path::new(pattern).is_dir() {
            Path::new(pattern).join("*.gz").to_string_lossy().into_owned()
        } else {
            pattern.clone()
        };
        let entries = glob::glob(&pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;

        for entry in entries {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Skipping unreadable path while expanding {pattern}: {e}");
                    continue;
                }
            };
            let meta = match std::fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Skipping {}: {e}", path.display());
                    continue;
                }
            };
            if !seen.insert(path.clone()) {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push(Found { path, modified });
        }
    }
    Ok(out)
}
