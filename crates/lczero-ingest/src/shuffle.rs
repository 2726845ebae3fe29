//! シャッフルバッファ
//!
//! 容量 `capacity` のスロットを持ち、満杯になった後は挿入のたびに
//! 一様乱数で選んだスロットの中身を吐き出して新しいレコードで置き換える。
//! メモリ使用量は O(capacity) のまま、ストリーム全体の局所的な相関
//! （同一対局の連続レコード）を崩す。
//!
//! 単一のコンシューマが `&mut self` で所有する前提で、ロックは持たない。

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub struct ShuffleBuffer<T, R = Xoshiro256PlusPlus> {
    slots: Vec<T>,
    capacity: usize,
    rng: R,
}

impl<T> ShuffleBuffer<T, Xoshiro256PlusPlus> {
    /// シードを指定しない場合は OS 乱数で初期化する
    pub fn new(capacity: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_os_rng(),
        };
        Self::with_rng(capacity, rng)
    }
}

impl<T, R: Rng> ShuffleBuffer<T, R> {
    pub fn with_rng(capacity: usize, rng: R) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            rng,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 埋まっているスロット数
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// 挿入し、満杯なら置き換えたレコードを返す
    ///
    /// 容量 0 の場合は素通しになる。
    pub fn insert(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(item);
            return None;
        }
        let idx = self.rng.random_range(0..self.capacity);
        Some(std::mem::replace(&mut self.slots[idx], item))
    }

    /// 一様乱数で1件取り出す
    pub fn extract(&mut self) -> Option<T> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = self.rng.random_range(0..self.slots.len());
        Some(self.slots.swap_remove(idx))
    }

    /// 残りをすべてランダム順で吐き出し、空に戻す
    pub fn drain(&mut self) -> Vec<T> {
        self.slots.shuffle(&mut self.rng);
        std::mem::replace(&mut self.slots, Vec::with_capacity(self.capacity))
    }

    /// 中身を捨てる（停止時）
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
