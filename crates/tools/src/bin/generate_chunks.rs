//! generate_chunks - 合成チャンクファイルの生成
//!
//! パイプラインの動作確認用に、ランダムな内容の V3/V4/V5 チャンクを
//! `<output>/train/training.N.gz` と `<output>/test/training.N.gz` に書き出す。
//!
//! # 使用例
//!
//! ```bash
//! # 既定: 学習用 9 ファイル、評価用 1 ファイル、各 100 レコード (V5 classic)
//! cargo run -p tools --bin generate_chunks -- --output test_data
//!
//! # V4、非圧縮 (training.N.bin)、シード指定
//! cargo run -p tools --bin generate_chunks -- \
//!   --output test_data --format-version 4 --plain --seed 42
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use lczero_ingest::record::{MovesLeft, SearchQ};
use lczero_ingest::{Compression, FormatVersion, InputFormat, Record, RecordMeta, write_chunk};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

#[derive(Parser)]
#[command(
    name = "generate_chunks",
    version,
    about = "合成チャンクファイルを生成\n\nランダムな方策・盤面・評価値を持つ V3/V4/V5 レコードを書き出す"
)]
struct Cli {
    /// 出力ディレクトリ（train/ と test/ を作る）
    #[arg(short, long, default_value = "test_data")]
    output: String,

    /// 学習用ファイル数
    #[arg(long, default_value_t = 9)]
    train_files: usize,

    /// 評価用ファイル数
    #[arg(long, default_value_t = 1)]
    test_files: usize,

    /// 1ファイルあたりのレコード数
    #[arg(long, default_value_t = 100)]
    records: usize,

    /// レコード形式 (3, 4, 5)
    #[arg(long, default_value_t = 5)]
    format_version: u32,

    /// V5 の入力形式名
    #[arg(long, default_value = "classic")]
    input_format: String,

    /// gzip 圧縮しない
    #[arg(long)]
    plain: bool,

    /// 乱数シード（再現性のため）
    #[arg(long)]
    seed: Option<u64>,
}

fn random_record(rng: &mut impl Rng, version: FormatVersion, input_format: InputFormat) -> Record {
    let q = SearchQ {
        root_q: rng.random_range(-1.0..1.0),
        best_q: rng.random_range(-1.0..1.0),
        root_d: rng.random_range(0.0..0.5),
        best_d: rng.random_range(0.0..0.5),
    };
    let meta = match version {
        FormatVersion::V3 => RecordMeta::V3,
        FormatVersion::V4 => RecordMeta::V4 { q },
        FormatVersion::V5 => RecordMeta::V5 {
            input_format,
            q,
            m: MovesLeft {
                root_m: rng.random_range(0.0..200.0),
                best_m: rng.random_range(0.0..200.0),
                plies_left: rng.random_range(0.0..200.0),
            },
        },
    };

    let mut r = Record::zeroed(meta);
    let mut sum = 0.0f32;
    for p in r.probabilities.iter_mut() {
        *p = rng.random::<f32>();
        sum += *p;
    }
    if sum > 0.0 {
        r.probabilities.iter_mut().for_each(|p| *p /= sum);
    }

    for plane in r.planes.iter_mut() {
        *plane = rng.random();
    }
    r.castling.us_ooo = rng.random_range(0..2);
    r.castling.us_oo = rng.random_range(0..2);
    r.castling.them_ooo = rng.random_range(0..2);
    r.castling.them_oo = rng.random_range(0..2);
    r.side_to_move = rng.random_range(0..2);
    r.rule50_count = rng.random_range(0..100);
    r.move_count = 0;
    r.result = *[-1i8, 0, 1].choose(rng).unwrap_or(&0);
    r
}

fn generate_set(
    dir: &Path,
    files: usize,
    cli: &Cli,
    version: FormatVersion,
    input_format: InputFormat,
    rng: &mut Xoshiro256PlusPlus,
    progress: &ProgressBar,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let (compression, ext) = if cli.plain {
        (Compression::Plain, "bin")
    } else {
        (Compression::Gzip, "gz")
    };

    for i in 0..files {
        let path = dir.join(format!("training.{}.{ext}", i + 1));
        let records: Vec<Record> =
            (0..cli.records).map(|_| random_record(rng, version, input_format)).collect();
        write_chunk(&path, &records, compression)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("Generated {} records in {}", cli.records, path.display());
        progress.inc(1);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let version = FormatVersion::try_from(cli.format_version)?;
    let input_format = InputFormat::from_name(&cli.input_format)?;
    if cli.records == 0 {
        anyhow::bail!("--records must be at least 1");
    }

    let mut rng = if let Some(seed) = cli.seed {
        eprintln!("Using seed: {seed}");
        Xoshiro256PlusPlus::seed_from_u64(seed)
    } else {
        Xoshiro256PlusPlus::from_os_rng()
    };

    let total = (cli.train_files + cli.test_files) as u64;
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} files {msg}")
            .expect("valid template"),
    );

    let root = Path::new(&cli.output);
    for (name, files) in [("train", cli.train_files), ("test", cli.test_files)] {
        progress.set_message(name);
        generate_set(
            &root.join(name),
            files,
            &cli,
            version,
            input_format,
            &mut rng,
            &progress,
        )?;
    }
    progress.finish_with_message("done");

    eprintln!(
        "Generated {} train / {} test chunks of {} {version} records ({} bytes each)",
        cli.train_files,
        cli.test_files,
        cli.records,
        version.record_size()
    );
    eprintln!("Training chunks: {}", root.join("train").display());
    eprintln!("Test chunks: {}", root.join("test").display());
    Ok(())
}
