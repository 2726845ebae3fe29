//! パイプラインの統計と診断
//!
//! ワーカーから見える共有状態は atomic カウンタと診断用の bounded channel のみ。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// 診断チャネルに溜める上限。溢れた分は件数のみ数える
pub const DIAGNOSTIC_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
pub struct PipelineStats {
    chunks_dispatched: AtomicU64,
    chunks_read: AtomicU64,
    chunks_skipped: AtomicU64,
    records_decoded: AtomicU64,
    records_dropped: AtomicU64,
    diagnostics_dropped: AtomicU64,
    discoveries: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn chunk_dispatched(&self) {
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_read(&self) {
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_skipped(&self) {
        self.chunks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decoded(&self) {
        self.records_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn discovery(&self) {
        self.discoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped.load(Ordering::Relaxed),
            records_decoded: self.records_decoded.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            diagnostics_dropped: self.diagnostics_dropped.load(Ordering::Relaxed),
            discoveries: self.discoveries.load(Ordering::Relaxed),
        }
    }
}

/// ある時点の統計値
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// ワーカーへ渡したチャンク数
    pub chunks_dispatched: u64,
    /// 最後まで読めたチャンク数
    pub chunks_read: u64,
    /// 開けない・壊れている等でスキップしたチャンク数
    pub chunks_skipped: u64,
    /// 出力チャネルへ送ったレコード数
    pub records_decoded: u64,
    /// 復号に失敗して捨てたレコード数
    pub records_dropped: u64,
    pub diagnostics_dropped: u64,
    /// チャンク探索の実行回数
    pub discoveries: u64,
}

/// 利用者向けの診断メッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    ChunkSkipped { path: PathBuf, reason: String },
    RecordDropped { path: PathBuf, index: u64, reason: String },
    Discovery { reason: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::ChunkSkipped { path, reason } => {
                write!(f, "skipped chunk {}: {reason}", path.display())
            }
            Diagnostic::RecordDropped {
                path,
                index,
                reason,
            } => write!(f, "dropped record {index} of {}: {reason}", path.display()),
            Diagnostic::Discovery { reason } => write!(f, "chunk discovery: {reason}"),
        }
    }
}

/// ワーカー側の診断送信口
#[derive(Clone)]
pub(crate) struct DiagnosticSink {
    tx: Sender<Diagnostic>,
}

impl DiagnosticSink {
    pub(crate) fn channel() -> (Self, Receiver<Diagnostic>) {
        let (tx, rx) = crossbeam_channel::bounded(DIAGNOSTIC_CAPACITY);
        (Self { tx }, rx)
    }

    /// 満杯・切断時は捨てて件数だけ数える（ワーカーをブロックしない）
    pub(crate) fn report(&self, stats: &PipelineStats, diag: Diagnostic) {
        match self.tx.try_send(diag) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                stats.diagnostics_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_is_counted() {
        let stats = PipelineStats::default();
        let (sink, rx) = DiagnosticSink::channel();
        for i in 0..DIAGNOSTIC_CAPACITY + 5 {
            sink.report(
                &stats,
                Diagnostic::Discovery {
                    reason: format!("#{i}"),
                },
            );
        }
        assert_eq!(rx.len(), DIAGNOSTIC_CAPACITY);
        assert_eq!(stats.snapshot().diagnostics_dropped, 5);
    }

    #[test]
    fn test_display() {
        let d = Diagnostic::ChunkSkipped {
            path: PathBuf::from("a/b.gz"),
            reason: "chunk is empty".into(),
        };
        assert_eq!(d.to_string(), "skipped chunk a/b.gz: chunk is empty");
    }
}
