//! デコードワーカープール
//!
//! フィーダースレッドがチャンクパスを bounded な作業チャネルへ流し、
//! W 本のワーカーがそれぞれ1ファイルずつ検査・復号して共有の出力チャネルへ送る。
//! 出力チャネルの容量が唯一のバックプレッシャーで、送信は短いタイムアウトで
//! 区切ってキャンセルを確認する。
//!
//! ワーカーがシャッフルバッファに触れることはない。

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::cancel::CancelToken;
use crate::error::{ChunkErrorKind, ChunkReadError, DecodeError, PipelineError};
use crate::io::ChunkFile;
use crate::record::{FormatVersion, InputFormat, Record};
use crate::source::ChunkSource;
use crate::stats::{Diagnostic, DiagnosticSink, PipelineStats};

/// チャネル待ちの間にキャンセルを確認する間隔
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// ワーカー間で共有する状態
pub(crate) struct WorkerContext {
    pub cancel: CancelToken,
    pub stats: Arc<PipelineStats>,
    pub diagnostics: DiagnosticSink,
    pub version: Option<FormatVersion>,
    pub expected_input_format: Option<InputFormat>,
}

/// キャンセルされるか受信側が消えるまで送信を試みる
///
/// 送れたら true。
pub(crate) fn send_cancellable<T>(tx: &Sender<T>, mut item: T, cancel: &CancelToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        match tx.send_timeout(item, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// キャンセルを見ながら眠る。キャンセルされたら false
fn sleep_cancellable(dur: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + dur;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

pub(crate) struct WorkerPool {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerPool {
    /// フィーダーと `workers` 本のワーカーを起動する
    ///
    /// `first_pass` は起動前の探索結果（設定エラーはそこで検出済み）。
    pub(crate) fn spawn(
        source: ChunkSource,
        first_pass: Vec<PathBuf>,
        rng: Xoshiro256PlusPlus,
        workers: usize,
        out_tx: Sender<Record>,
        ctx: Arc<WorkerContext>,
    ) -> Result<Self, PipelineError> {
        let (work_tx, work_rx) = crossbeam_channel::bounded::<PathBuf>(workers * 2);
        let mut pool = WorkerPool {
            handles: Vec::with_capacity(workers + 1),
        };

        for i in 0..workers {
            let name = format!("lczero-decode-{i}");
            let rx = work_rx.clone();
            let tx = out_tx.clone();
            let c = Arc::clone(&ctx);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || decode_worker(rx, tx, &c));
            pool.push(name, spawned, &ctx.cancel)?;
        }
        drop(work_rx);
        drop(out_tx);

        let name = "lczero-feeder".to_string();
        let c = Arc::clone(&ctx);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || feed(source, first_pass, rng, work_tx, &c));
        pool.push(name, spawned, &ctx.cancel)?;

        log::debug!("Started {workers} decode workers");
        Ok(pool)
    }

    fn push(
        &mut self,
        name: String,
        spawned: std::io::Result<JoinHandle<()>>,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        match spawned {
            Ok(h) => {
                self.handles.push((name, h));
                Ok(())
            }
            Err(source) => {
                cancel.cancel();
                let handles = std::mem::take(&mut self.handles);
                WorkerPool { handles }.join();
                Err(PipelineError::Spawn { name, source })
            }
        }
    }

    /// 全スレッドの終了を待つ
    pub(crate) fn join(self) {
        for (name, h) in self.handles {
            if h.join().is_err() {
                log::error!("{name} thread panicked");
            }
        }
    }
}

/// チャンクパスを作業チャネルへ流す
///
/// `rescan_interval` が無ければ1パスで終わる。ある場合はパスを最後まで流し、
/// 前回の探索から間隔が経ったら探索し直して次のパスを流す。
/// パスは途中で打ち切らない。
fn feed(
    source: ChunkSource,
    first_pass: Vec<PathBuf>,
    mut rng: Xoshiro256PlusPlus,
    work_tx: Sender<PathBuf>,
    ctx: &WorkerContext,
) {
    let rescan = source.rescan_interval();
    let mut pass = first_pass;
    let mut last_scan = Instant::now();

    loop {
        for path in pass {
            if !send_cancellable(&work_tx, path, &ctx.cancel) {
                return;
            }
            ctx.stats.chunk_dispatched();
        }
        let Some(interval) = rescan else {
            return;
        };
        // 次の探索は前回から interval 経過後
        let wait = interval.saturating_sub(last_scan.elapsed());
        if !sleep_cancellable(wait, &ctx.cancel) {
            return;
        }
        pass = rediscover(&source, &mut rng, ctx);
        last_scan = Instant::now();
    }
}

fn rediscover(
    source: &ChunkSource,
    rng: &mut Xoshiro256PlusPlus,
    ctx: &WorkerContext,
) -> Vec<PathBuf> {
    match source.discover(rng) {
        Ok(paths) => {
            ctx.stats.discovery();
            paths
        }
        Err(e) => {
            log::warn!("Chunk rediscovery failed: {e}");
            ctx.diagnostics.report(
                &ctx.stats,
                Diagnostic::Discovery {
                    reason: e.to_string(),
                },
            );
            Vec::new()
        }
    }
}

fn decode_worker(work_rx: Receiver<PathBuf>, out_tx: Sender<Record>, ctx: &WorkerContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        let path = match work_rx.recv_timeout(POLL_INTERVAL) {
            Ok(p) => p,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if !decode_chunk(path, &out_tx, ctx) {
            return;
        }
    }
}

/// 1ファイルを復号して送る。停止すべきなら false
fn decode_chunk(path: PathBuf, out_tx: &Sender<Record>, ctx: &WorkerContext) -> bool {
    let chunk = match ChunkFile::probe(&path, ctx.version, &ctx.cancel) {
        Ok(c) => c,
        Err(e) => {
            skip_chunk(e, ctx);
            return !ctx.cancel.is_cancelled();
        }
    };
    let records = match chunk.records(ctx.expected_input_format) {
        Ok(r) => r,
        Err(e) => {
            skip_chunk(e, ctx);
            return true;
        }
    };
    log::trace!(
        "Decoding {} ({} {} records)",
        path.display(),
        chunk.record_count,
        chunk.version
    );

    for item in records {
        if ctx.cancel.is_cancelled() {
            return false;
        }
        match item {
            Ok(record) => {
                if !send_cancellable(out_tx, record, &ctx.cancel) {
                    return false;
                }
                ctx.stats.record_decoded();
            }
            Err(DecodeError::Record { index, source }) => {
                log::debug!("Dropping record {index} of {}: {source}", path.display());
                ctx.stats.record_dropped();
                ctx.diagnostics.report(
                    &ctx.stats,
                    Diagnostic::RecordDropped {
                        path: path.clone(),
                        index,
                        reason: source.to_string(),
                    },
                );
            }
            Err(DecodeError::Chunk(e)) => {
                skip_chunk(e, ctx);
                return true;
            }
        }
    }
    ctx.stats.chunk_read();
    true
}

fn skip_chunk(e: ChunkReadError, ctx: &WorkerContext) {
    if matches!(e.kind, ChunkErrorKind::Interrupted) && ctx.cancel.is_cancelled() {
        return;
    }
    log::warn!("Skipping {e}");
    ctx.stats.chunk_skipped();
    ctx.diagnostics.report(
        &ctx.stats,
        Diagnostic::ChunkSkipped {
            path: e.path,
            reason: e.kind.to_string(),
        },
    );
}
