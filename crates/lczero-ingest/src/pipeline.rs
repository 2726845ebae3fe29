//! パイプライン制御
//!
//! 設定検証・初回探索・スレッド起動を `start` で行い、
//! コンシューマには `next_batch` でプル型のバッチ供給を提供する。

use std::sync::Arc;

use crossbeam_channel::Receiver;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::batch::{Batch, BatchAssembler, ShuffledStream};
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::shuffle::ShuffleBuffer;
use crate::source::ChunkSource;
use crate::stats::{Diagnostic, DiagnosticSink, PipelineStats, StatsSnapshot};
use crate::worker::{WorkerContext, WorkerPool};

/// 他スレッド（シグナルハンドラ等）から停止を要求するためのハンドル
///
/// フラグを立てるだけで、スレッドの回収は `Pipeline::stop` / `Drop` が行う。
#[derive(Debug, Clone)]
pub struct StopHandle(CancelToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

pub struct Pipeline {
    assembler: BatchAssembler<ShuffledStream>,
    batch_size: usize,
    cancel: CancelToken,
    workers: Option<WorkerPool>,
    stats: Arc<PipelineStats>,
    diagnostics: Receiver<Diagnostic>,
    stopped: bool,
}

impl Pipeline {
    /// 設定を検証し、初回探索を行ってワーカーを起動する
    ///
    /// 設定エラー（チャンクが見つからない等）はここで返り、スレッドは起動しない。
    pub fn start(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_os_rng(),
        };
        let source = ChunkSource::new(config.source.clone(), config.role);
        let first_pass = source.discover(&mut rng)?;

        let stats = Arc::new(PipelineStats::default());
        stats.discovery();
        let cancel = CancelToken::new();
        let (sink, diagnostics) = DiagnosticSink::channel();
        let ctx = Arc::new(WorkerContext {
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            diagnostics: sink,
            version: config.version,
            expected_input_format: config.expected_input_format,
        });

        log::info!(
            "Starting {:?} pipeline: {} chunks, {} workers, shuffle buffer {}, batch size {}",
            config.role,
            first_pass.len(),
            config.workers,
            config.shuffle_capacity,
            config.batch_size
        );

        let buffer = ShuffleBuffer::with_rng(
            config.shuffle_capacity,
            Xoshiro256PlusPlus::seed_from_u64(rng.random()),
        );
        let (tx, rx) = crossbeam_channel::bounded(config.channel_capacity);
        let workers = WorkerPool::spawn(source, first_pass, rng, config.workers, tx, ctx)?;

        let stream = ShuffledStream::new(rx, buffer, cancel.clone(), config.drain_on_exhaustion);
        Ok(Self {
            assembler: BatchAssembler::new(stream, config.propagate_legal_mask),
            batch_size: config.batch_size,
            cancel,
            workers: Some(workers),
            stats,
            diagnostics,
            stopped: false,
        })
    }

    /// 次のバッチ
    ///
    /// - `Ok(Some(batch))`: `batch_size` 件（最後だけ短いことがある）
    /// - `Ok(None)`: 入力が尽きた
    /// - `Err(PipelineError::Shutdown)`: 停止済み
    pub fn next_batch(&mut self) -> Result<Option<Batch>, PipelineError> {
        if self.stopped {
            return Err(PipelineError::Shutdown);
        }
        self.assembler.next_batch(self.batch_size)
    }

    /// 停止してスレッドを回収する（何度呼んでもよい）
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel.cancel();
        self.assembler.stream_mut().close();
        if let Some(workers) = self.workers.take() {
            workers.join();
        }
        log::debug!("Pipeline stopped: {:?}", self.stats.snapshot());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.cancel.clone())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// ここまでに溜まった診断を取り出す
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.try_iter().collect()
    }

    /// シャッフルバッファ内のレコード数
    pub fn buffered(&self) -> usize {
        self.assembler.stream().buffered()
    }
}

impl Iterator for Pipeline {
    type Item = Batch;

    /// 入力終了または停止で `None`
    fn next(&mut self) -> Option<Batch> {
        match self.next_batch() {
            Ok(batch) => batch,
            Err(e) => {
                log::debug!("Batch iteration ended: {e}");
                None
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
