//! バッチ組み立て
//!
//! シャッフル済みのレコード列から `batch_size` 件ずつ切り出す。
//! 入力が尽きたら端数のバッチを1つ返し、その後は `None`。
//! 並べ替えも復号もしない。

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::cancel::CancelToken;
use crate::error::{ConfigError, PipelineError};
use crate::record::{INPUT_PLANES, POLICY_SIZE, Record, SQUARES};
use crate::shuffle::ShuffleBuffer;
use crate::worker::POLL_INTERVAL;

/// ストリームから1件取り出した結果
#[derive(Debug)]
pub enum StreamItem {
    Record(Record),
    /// すべてのワーカーが終了し、バッファも空
    Exhausted,
    Cancelled,
}

/// バッチ組み立ての入力
pub trait RecordStream {
    /// 次のレコードが来るまでブロックする（キャンセルは随時確認）
    fn next_record(&mut self) -> StreamItem;
}

/// 出力チャネルの受信側とシャッフルバッファをまとめたもの
///
/// コンシューマスレッドだけが所有する。
pub struct ShuffledStream {
    rx: Option<Receiver<Record>>,
    buffer: ShuffleBuffer<Record>,
    draining: VecDeque<Record>,
    cancel: CancelToken,
    drain_on_exhaustion: bool,
    exhausted: bool,
}

impl ShuffledStream {
    pub fn new(
        rx: Receiver<Record>,
        buffer: ShuffleBuffer<Record>,
        cancel: CancelToken,
        drain_on_exhaustion: bool,
    ) -> Self {
        Self {
            rx: Some(rx),
            buffer,
            draining: VecDeque::new(),
            cancel,
            drain_on_exhaustion,
            exhausted: false,
        }
    }

    /// 受信側を手放し、バッファを空にする
    ///
    /// 受信側が消えるとワーカーの送信は即座に失敗する。
    pub fn close(&mut self) {
        self.rx = None;
        self.buffer.clear();
        self.draining.clear();
    }

    /// バッファ内のレコード数
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.draining.len()
    }
}

impl RecordStream for ShuffledStream {
    fn next_record(&mut self) -> StreamItem {
        loop {
            if self.cancel.is_cancelled() {
                return StreamItem::Cancelled;
            }
            if let Some(r) = self.draining.pop_front() {
                return StreamItem::Record(r);
            }
            if self.exhausted {
                return StreamItem::Exhausted;
            }
            let Some(rx) = &self.rx else {
                return StreamItem::Cancelled;
            };
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(record) => {
                    if let Some(out) = self.buffer.insert(record) {
                        return StreamItem::Record(out);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.exhausted = true;
                    if self.drain_on_exhaustion {
                        self.draining.extend(self.buffer.drain());
                    } else {
                        let left = self.buffer.len();
                        if left > 0 {
                            log::info!("Discarding {left} buffered records at end of stream");
                        }
                        self.buffer.clear();
                    }
                }
            }
        }
    }
}

/// 学習ステップ1回分のレコード
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<Record>,
    legal_masks: Option<Vec<Vec<bool>>>,
}

impl Batch {
    pub fn new(records: Vec<Record>, with_legal_masks: bool) -> Self {
        let legal_masks =
            with_legal_masks.then(|| records.iter().map(Record::legal_mask).collect());
        Self {
            records,
            legal_masks,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn legal_masks(&self) -> Option<&[Vec<bool>]> {
        self.legal_masks.as_deref()
    }

    /// [len, 112, 64] の入力平面
    pub fn planes(&self) -> Vec<f32> {
        let per = INPUT_PLANES * SQUARES;
        let mut out = vec![0.0; self.len() * per];
        for (dst, r) in out.chunks_exact_mut(per).zip(&self.records) {
            r.write_input_planes(dst);
        }
        out
    }

    /// [len, 1858] の方策ターゲット
    pub fn policy(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.len() * POLICY_SIZE);
        for r in &self.records {
            out.extend_from_slice(&r.probabilities[..]);
        }
        out
    }

    /// [len, 3] の対局結果 WDL
    pub fn wdl(&self) -> Vec<f32> {
        self.records.iter().flat_map(Record::wdl).collect()
    }

    /// [len, 3] の探索値 WDL。V3 が混ざっていれば None
    pub fn q_wdl(&self) -> Option<Vec<f32>> {
        let mut out = Vec::with_capacity(self.len() * 3);
        for r in &self.records {
            out.extend(r.q_wdl()?);
        }
        Some(out)
    }

    /// [len] の残り手数。V5 以外が混ざっていれば None
    pub fn moves_left(&self) -> Option<Vec<f32>> {
        self.records
            .iter()
            .map(|r| r.moves_left().map(|m| m.plies_left))
            .collect()
    }
}

pub struct BatchAssembler<S> {
    stream: S,
    propagate_legal_mask: bool,
    finished: bool,
    emitted: u64,
}

impl<S: RecordStream> BatchAssembler<S> {
    pub fn new(stream: S, propagate_legal_mask: bool) -> Self {
        Self {
            stream,
            propagate_legal_mask,
            finished: false,
            emitted: 0,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// これまでに返したレコード数
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// `size` 件のバッチを返す
    ///
    /// 入力が尽きたときは残りで作った短いバッチを1度だけ返し、以降は `Ok(None)`。
    /// キャンセル時は集めかけのレコードを捨てて `Shutdown`。
    pub fn next_batch(&mut self, size: usize) -> Result<Option<Batch>, PipelineError> {
        if size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1").into());
        }
        if self.finished {
            return Ok(None);
        }

        let mut records = Vec::with_capacity(size);
        while records.len() < size {
            match self.stream.next_record() {
                StreamItem::Record(r) => records.push(r),
                StreamItem::Exhausted => {
                    self.finished = true;
                    break;
                }
                StreamItem::Cancelled => return Err(PipelineError::Shutdown),
            }
        }

        if self.finished && self.emitted == 0 && records.is_empty() {
            log::warn!(
                "Record stream ended without producing any records; \
                 every chunk was missing, empty or undecodable (see diagnostics)"
            );
        }
        if records.is_empty() {
            return Ok(None);
        }
        self.emitted += records.len() as u64;
        Ok(Some(Batch::new(records, self.propagate_legal_mask)))
    }
}
