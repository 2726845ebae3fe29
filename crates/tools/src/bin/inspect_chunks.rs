//! inspect_chunks - チャンク群をパイプラインに通して集計
//!
//! 設定ファイルまたは glob パターンで指定したチャンクを実際に復号・シャッフル・
//! バッチ化し、読めたレコード数やスキップしたファイルを報告する。
//! Ctrl-C でパイプラインを停止し、そこまでの集計を出力する。
//!
//! # 使用例
//!
//! ```bash
//! # glob 指定
//! cargo run -p tools --bin inspect_chunks -- --input 'test_data/train/*.gz'
//!
//! # 設定ファイルの評価用セットを JSON で報告
//! cargo run -p tools --bin inspect_chunks -- --config lczero.toml --role test --json
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use lczero_ingest::{
    ChunkRole, DatasetConfig, Diagnostic, InputFormat, InputSpec, Pipeline, PipelineConfig,
};
use serde::Serialize;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Train,
    Test,
    Validation,
}

impl From<Role> for ChunkRole {
    fn from(r: Role) -> Self {
        match r {
            Role::Train => ChunkRole::Train,
            Role::Test => ChunkRole::Test,
            Role::Validation => ChunkRole::Validation,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "inspect_chunks",
    version,
    about = "チャンクファイルをパイプラインに通して集計\n\n復号できたレコード数、スキップしたファイル、バージョン内訳を報告"
)]
struct Cli {
    /// TOML 設定ファイル（[dataset] / [training]）
    #[arg(short, long, conflicts_with = "input")]
    config: Option<PathBuf>,

    /// チャンクの glob パターンまたはディレクトリ（複数指定可）
    #[arg(short, long, num_args = 1..)]
    input: Vec<String>,

    /// 設定ファイル使用時にどのセットを読むか
    #[arg(long, value_enum, default_value_t = Role::Train)]
    role: Role,

    /// ワーカー数（設定ファイルより優先）
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    shuffle_size: Option<usize>,

    /// 読み込むバッチ数の上限
    #[arg(long)]
    max_batches: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,

    /// 集計を JSON で標準出力に書く
    #[arg(long)]
    json: bool,
}

#[derive(Serialize, Default)]
struct Summary {
    batches: u64,
    records: u64,
    /// バージョン別のレコード数
    versions: BTreeMap<String, u64>,
    /// V5 入力形式別のレコード数
    input_formats: BTreeMap<String, u64>,
    chunks_dispatched: u64,
    chunks_read: u64,
    chunks_skipped: u64,
    records_dropped: u64,
    diagnostics_dropped: u64,
    skipped: Vec<String>,
    interrupted: bool,
    elapsed_secs: f64,
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => DatasetConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
            .pipeline_config(cli.role.into())?,
        None => {
            if cli.input.is_empty() {
                anyhow::bail!("Either --config or --input is required");
            }
            let mut c = PipelineConfig::new(InputSpec::Split {
                train: cli.input.clone(),
                test: Vec::new(),
            });
            c.source.allow_less_chunks = true;
            c
        }
    };
    if let Some(w) = cli.workers {
        config.workers = w;
    }
    if let Some(b) = cli.batch_size {
        config.batch_size = b;
    }
    if let Some(s) = cli.shuffle_size {
        config.shuffle_capacity = s;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    config.validate()?;
    Ok(config)
}

fn format_name(f: InputFormat) -> String {
    f.name().map_or_else(|| format!("unknown({})", f.0), str::to_string)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let started = Instant::now();
    let mut pipeline = Pipeline::start(config).context("Failed to start pipeline")?;

    // Ctrl-Cハンドラを設定
    let handle = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted!");
        handle.stop();
    })
    .context("Failed to set Ctrl-C handler")?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] {spinner} {pos} records ({per_sec}) {msg}")
            .expect("valid template"),
    );

    let mut summary = Summary::default();
    loop {
        if cli.max_batches.is_some_and(|m| summary.batches >= m) {
            break;
        }
        let batch = match pipeline.next_batch() {
            Ok(Some(b)) => b,
            Ok(None) => break,
            Err(e) if e.is_shutdown() => {
                summary.interrupted = true;
                break;
            }
            Err(e) => return Err(e.into()),
        };
        summary.batches += 1;
        summary.records += batch.len() as u64;
        for r in batch.records() {
            *summary.versions.entry(r.version().to_string()).or_default() += 1;
            if let Some(f) = r.input_format() {
                *summary.input_formats.entry(format_name(f)).or_default() += 1;
            }
        }
        progress.inc(batch.len() as u64);
        progress.set_message(format!("{} batches", summary.batches));
    }
    pipeline.stop();
    progress.finish_and_clear();

    let stats = pipeline.stats();
    summary.chunks_dispatched = stats.chunks_dispatched;
    summary.chunks_read = stats.chunks_read;
    summary.chunks_skipped = stats.chunks_skipped;
    summary.records_dropped = stats.records_dropped;
    summary.diagnostics_dropped = stats.diagnostics_dropped;
    summary.skipped = pipeline
        .take_diagnostics()
        .into_iter()
        .filter(|d| matches!(d, Diagnostic::ChunkSkipped { .. }))
        .map(|d| d.to_string())
        .collect();
    summary.elapsed_secs = started.elapsed().as_secs_f64();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        eprintln!(
            "{} records in {} batches ({:.1}s)",
            summary.records, summary.batches, summary.elapsed_secs
        );
        eprintln!(
            "Chunks: {} dispatched, {} read, {} skipped; {} records dropped",
            summary.chunks_dispatched,
            summary.chunks_read,
            summary.chunks_skipped,
            summary.records_dropped
        );
        for (v, n) in &summary.versions {
            eprintln!("  {v}: {n}");
        }
        for (f, n) in &summary.input_formats {
            eprintln!("  input format {f}: {n}");
        }
        for s in &summary.skipped {
            eprintln!("  {s}");
        }
        if summary.interrupted {
            eprintln!("Note: Processing was interrupted, counts are partial");
        }
    }
    Ok(())
}
