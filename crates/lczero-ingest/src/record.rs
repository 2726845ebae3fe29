//! 学習レコード
//!
//! チャンクファイルの1レコード（1局面分の教師データ）を表す。
//! バイト配置はバージョンごとに異なるが、意味はバージョン間で共通。
//!
//! # データ形式
//!
//! | Version | 追加フィールド                                     | サイズ |
//! |---------|----------------------------------------------------|--------|
//! | V3      | なし                                               | 8276   |
//! | V4      | root_q, best_q, root_d, best_d                     | 8292   |
//! | V5      | input_format, root_m, best_m, plies_left (+V4)     | 8308   |
//!
//! 共通部分は version タグ (u32)、方策 1858×f32、ビットボード 104×u64、
//! キャスリング4バイト、手番、50手ルールカウンタ、手数（非推奨）、勝敗 (i8)。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 方策ベクトルの長さ（グローバル指し手インデックス空間）
pub const POLICY_SIZE: usize = 1858;
/// レコードに格納されるビットボード平面の数
pub const PACKED_PLANES: usize = 104;
/// 展開後の入力平面数（ビットボード 104 + 補助平面 8）
pub const INPUT_PLANES: usize = 112;
/// 1平面のマス数
pub const SQUARES: usize = 64;

/// レコード形式のバージョン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum FormatVersion {
    V3,
    V4,
    V5,
}

impl FormatVersion {
    pub const ALL: [FormatVersion; 3] = [FormatVersion::V3, FormatVersion::V4, FormatVersion::V5];

    /// レコード先頭に書かれるバージョンタグ
    pub const fn tag(self) -> u32 {
        match self {
            FormatVersion::V3 => 3,
            FormatVersion::V4 => 4,
            FormatVersion::V5 => 5,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            3 => Some(FormatVersion::V3),
            4 => Some(FormatVersion::V4),
            5 => Some(FormatVersion::V5),
            _ => None,
        }
    }

    /// 1レコードのバイト数
    pub const fn record_size(self) -> usize {
        match self {
            FormatVersion::V3 => 8276,
            FormatVersion::V4 => 8292,
            FormatVersion::V5 => 8308,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            FormatVersion::V3 => 0,
            FormatVersion::V4 => 1,
            FormatVersion::V5 => 2,
        }
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.tag())
    }
}

impl TryFrom<u32> for FormatVersion {
    type Error = ConfigError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        FormatVersion::from_tag(tag).ok_or(ConfigError::UnsupportedVersion(tag))
    }
}

impl From<FormatVersion> for u32 {
    fn from(v: FormatVersion) -> u32 {
        v.tag()
    }
}

/// V5 レコードの入力エンコーディング種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputFormat(pub u32);

impl InputFormat {
    pub const CLASSIC: InputFormat = InputFormat(1);
    pub const FRC_CASTLING: InputFormat = InputFormat(2);
    pub const CANONICAL: InputFormat = InputFormat(3);
    pub const CANONICAL_100: InputFormat = InputFormat(4);
    pub const CANONICAL_V2: InputFormat = InputFormat(5);
    pub const CANONICAL_ARMAGEDDON: InputFormat = InputFormat(132);
    pub const CANONICAL_V2_ARMAGEDDON: InputFormat = InputFormat(133);

    const NAMES: [(&'static str, InputFormat); 7] = [
        ("classic", InputFormat::CLASSIC),
        ("frc_castling", InputFormat::FRC_CASTLING),
        ("canonical", InputFormat::CANONICAL),
        ("canonical_100", InputFormat::CANONICAL_100),
        ("canonical_v2", InputFormat::CANONICAL_V2),
        ("canonical_armageddon", InputFormat::CANONICAL_ARMAGEDDON),
        ("canonical_v2_armageddon", InputFormat::CANONICAL_V2_ARMAGEDDON),
    ];

    /// 設定ファイルの `input_type` 名から変換
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        Self::NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
            .map(|&(_, f)| f)
            .ok_or_else(|| ConfigError::UnknownInputFormat(name.to_string()))
    }

    pub fn name(self) -> Option<&'static str> {
        Self::NAMES.iter().find(|(_, f)| *f == self).map(|&(n, _)| n)
    }

    pub fn is_classic(self) -> bool {
        self == InputFormat::CLASSIC
    }
}

/// 探索由来の Q 値・引き分け確率（V4 以降）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SearchQ {
    pub root_q: f32,
    pub best_q: f32,
    pub root_d: f32,
    pub best_d: f32,
}

/// 残り手数の推定値（V5）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovesLeft {
    pub root_m: f32,
    pub best_m: f32,
    pub plies_left: f32,
}

/// バージョン固有のフィールド
///
/// バージョンタグとフィールドの組み合わせが矛盾しないよう、列挙子で持つ。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordMeta {
    V3,
    V4 {
        q: SearchQ,
    },
    V5 {
        input_format: InputFormat,
        q: SearchQ,
        m: MovesLeft,
    },
}

impl RecordMeta {
    pub fn version(&self) -> FormatVersion {
        match self {
            RecordMeta::V3 => FormatVersion::V3,
            RecordMeta::V4 { .. } => FormatVersion::V4,
            RecordMeta::V5 { .. } => FormatVersion::V5,
        }
    }
}

/// キャスリング権（classic 以外の入力形式ではルーク筋のビットマスク）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Castling {
    pub us_ooo: u8,
    pub us_oo: u8,
    pub them_ooo: u8,
    pub them_oo: u8,
}

/// 学習レコード1件
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// 方策ターゲット（非合法手は -1）
    pub probabilities: Box<[f32; POLICY_SIZE]>,
    /// 駒配置・履歴のビットボード
    pub planes: Box<[u64; PACKED_PLANES]>,
    pub castling: Castling,
    /// 手番（canonical 系入力では en passant のマスク）
    pub side_to_move: u8,
    pub rule50_count: u8,
    /// 非推奨の手数フィールド
    pub move_count: u8,
    /// 勝敗 (1=勝ち, 0=引分, -1=負け)
    pub result: i8,
    pub meta: RecordMeta,
}

impl Record {
    /// 全フィールドがゼロのレコード
    pub fn zeroed(meta: RecordMeta) -> Self {
        Self {
            probabilities: Box::new([0.0; POLICY_SIZE]),
            planes: Box::new([0; PACKED_PLANES]),
            castling: Castling::default(),
            side_to_move: 0,
            rule50_count: 0,
            move_count: 0,
            result: 0,
            meta,
        }
    }

    pub fn version(&self) -> FormatVersion {
        self.meta.version()
    }

    pub fn input_format(&self) -> Option<InputFormat> {
        match self.meta {
            RecordMeta::V5 { input_format, .. } => Some(input_format),
            _ => None,
        }
    }

    pub fn search_q(&self) -> Option<&SearchQ> {
        match &self.meta {
            RecordMeta::V3 => None,
            RecordMeta::V4 { q } | RecordMeta::V5 { q, .. } => Some(q),
        }
    }

    pub fn moves_left(&self) -> Option<&MovesLeft> {
        match &self.meta {
            RecordMeta::V5 { m, .. } => Some(m),
            _ => None,
        }
    }

    /// 対局結果から作る WDL ターゲット
    pub fn wdl(&self) -> [f32; 3] {
        match self.result {
            r if r > 0 => [1.0, 0.0, 0.0],
            0 => [0.0, 1.0, 0.0],
            _ => [0.0, 0.0, 1.0],
        }
    }

    /// best_q / best_d から作る WDL ターゲット（V4 以降）
    pub fn q_wdl(&self) -> Option<[f32; 3]> {
        self.search_q().map(|q| {
            let w = 0.5 * (1.0 - q.best_d + q.best_q);
            let l = 0.5 * (1.0 - q.best_d - q.best_q);
            [w, q.best_d, l]
        })
    }

    /// 合法手マスク（方策が非負の指し手を合法とみなす）
    pub fn legal_mask(&self) -> Vec<bool> {
        self.probabilities.iter().map(|&p| p >= 0.0).collect()
    }

    /// 112×64 の f32 入力平面に展開する
    pub fn input_planes(&self) -> Vec<f32> {
        let mut out = vec![0.0; INPUT_PLANES * SQUARES];
        self.write_input_planes(&mut out);
        out
    }

    /// `out` は `INPUT_PLANES * SQUARES` 要素であること
    pub fn write_input_planes(&self, out: &mut [f32]) {
        debug_assert_eq!(out.len(), INPUT_PLANES * SQUARES);

        for (plane, &bb) in out.chunks_exact_mut(SQUARES).zip(self.planes.iter()) {
            for (sq, v) in plane.iter_mut().enumerate() {
                *v = if bitboard_bit(bb, sq) { 1.0 } else { 0.0 };
            }
        }

        let aux = &mut out[PACKED_PLANES * SQUARES..];
        let classic = self.input_format().is_none_or(InputFormat::is_classic);
        let castling = [
            (self.castling.us_ooo, false),
            (self.castling.us_oo, false),
            (self.castling.them_ooo, true),
            (self.castling.them_oo, true),
        ];
        for (plane, (byte, far_rank)) in aux.chunks_exact_mut(SQUARES).zip(castling) {
            if classic {
                plane.fill(f32::from(byte));
            } else {
                fill_rank_mask(plane, byte, far_rank);
            }
        }

        let stm = &mut aux[4 * SQUARES..5 * SQUARES];
        if classic {
            stm.fill(f32::from(self.side_to_move));
        } else {
            fill_rank_mask(stm, self.side_to_move, true);
        }
        aux[5 * SQUARES..6 * SQUARES].fill(f32::from(self.rule50_count) / 99.0);
        aux[6 * SQUARES..7 * SQUARES].fill(0.0);
        aux[7 * SQUARES..8 * SQUARES].fill(1.0);
    }
}

/// ビットボードはバイト単位で MSB から a..h の順に並ぶ
fn bitboard_bit(bb: u64, sq: usize) -> bool {
    let byte = sq / 8;
    let bit = 7 - (sq % 8);
    (bb >> (byte * 8 + bit)) & 1 == 1
}

fn fill_rank_mask(plane: &mut [f32], mask: u8, far_rank: bool) {
    plane.fill(0.0);
    let base = if far_rank { 56 } else { 0 };
    for file in 0..8 {
        if (mask >> (7 - file)) & 1 == 1 {
            plane[base + file] = 1.0;
        }
    }
}
