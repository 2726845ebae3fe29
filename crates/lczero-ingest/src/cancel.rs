use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 協調的キャンセル用のフラグ
///
/// ワーカーはレコード間で、コンシューマはチャネル受信の合間で確認する。
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
