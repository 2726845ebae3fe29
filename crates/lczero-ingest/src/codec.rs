//! レコードのバイナリ復号／符号化
//!
//! バージョンごとの固定長レイアウトを `LAYOUTS` テーブルで切り替える。
//! すべてリトルエンディアン・パディングなし。方策・平面はビット単位で保持し、
//! 正規化などの加工は行わない。

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{MalformedRecord, VersionDetectError};
use crate::record::{
    Castling, FormatVersion, InputFormat, MovesLeft, PACKED_PLANES, POLICY_SIZE, Record,
    RecordMeta, SearchQ,
};

const POLICY_BYTES: usize = POLICY_SIZE * 4;
const PLANE_BYTES: usize = PACKED_PLANES * 8;

/// バージョンごとの復号・符号化関数
struct Layout {
    version: FormatVersion,
    decode: fn(&[u8]) -> Result<Record, MalformedRecord>,
    encode: fn(&Record, &mut [u8]),
}

/// `FormatVersion::index()` で引くディスパッチテーブル
static LAYOUTS: [Layout; 3] = [
    Layout {
        version: FormatVersion::V3,
        decode: decode_v3,
        encode: encode_v3,
    },
    Layout {
        version: FormatVersion::V4,
        decode: decode_v4,
        encode: encode_v4,
    },
    Layout {
        version: FormatVersion::V5,
        decode: decode_v5,
        encode: encode_v5,
    },
];

fn layout(version: FormatVersion) -> &'static Layout {
    let l = &LAYOUTS[version.index()];
    debug_assert_eq!(l.version, version);
    l
}

/// 1レコードを復号する
pub fn decode(bytes: &[u8], version: FormatVersion) -> Result<Record, MalformedRecord> {
    let expected = version.record_size();
    if bytes.len() != expected {
        return Err(MalformedRecord::SizeMismatch {
            version,
            expected,
            actual: bytes.len(),
        });
    }
    let tag = LittleEndian::read_u32(&bytes[0..4]);
    if tag != version.tag() {
        return Err(MalformedRecord::VersionTag {
            expected: version,
            found: tag,
        });
    }
    (layout(version).decode)(bytes)
}

/// 復号に加え、V5 の入力形式が `expected_input_format` と一致するか検査する
pub fn decode_checked(
    bytes: &[u8],
    version: FormatVersion,
    expected_input_format: Option<InputFormat>,
) -> Result<Record, MalformedRecord> {
    let record = decode(bytes, version)?;
    if let (Some(expected), Some(found)) = (expected_input_format, record.input_format()) {
        if expected != found {
            return Err(MalformedRecord::input_format(expected, found));
        }
    }
    Ok(record)
}

/// 1レコードを符号化する
pub fn encode(record: &Record) -> Vec<u8> {
    let version = record.version();
    let mut out = vec![0u8; version.record_size()];
    (layout(version).encode)(record, &mut out);
    out
}

/// 既存のバッファへ符号化する
///
/// `out` の長さがレコードのバージョンのサイズと違えば何も書かずに
/// `SizeMismatch` を返す。
pub fn encode_into(record: &Record, out: &mut [u8]) -> Result<(), MalformedRecord> {
    let version = record.version();
    if out.len() != version.record_size() {
        return Err(MalformedRecord::SizeMismatch {
            version,
            expected: version.record_size(),
            actual: out.len(),
        });
    }
    (layout(version).encode)(record, out);
    Ok(())
}

/// 展開後のバイト長からバージョンを推定する
///
/// 割り切れるレコードサイズがちょうど1つの場合のみ成功する。
pub fn detect_version(total_len: u64) -> Result<FormatVersion, VersionDetectError> {
    if total_len == 0 {
        return Err(VersionDetectError::Undetectable { len: 0 });
    }
    let candidates: Vec<FormatVersion> = FormatVersion::ALL
        .into_iter()
        .filter(|v| total_len % v.record_size() as u64 == 0)
        .collect();
    match candidates.as_slice() {
        [] => Err(VersionDetectError::Undetectable { len: total_len }),
        [only] => Ok(*only),
        _ => Err(VersionDetectError::Ambiguous {
            len: total_len,
            candidates,
        }),
    }
}

// ---------------------------------------------------------------------------
// 共通部分
// ---------------------------------------------------------------------------

/// 固定長バッファ上の読み取りカーソル
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn u32(&mut self) -> u32 {
        LittleEndian::read_u32(self.take(4))
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, MalformedRecord> {
        let v = LittleEndian::read_f32(self.take(4));
        if v.is_finite() {
            Ok(v)
        } else {
            Err(MalformedRecord::NonFinite { field })
        }
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn slot(&mut self, n: usize) -> &mut [u8] {
        let s = &mut self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    fn u8(&mut self, v: u8) {
        self.slot(1)[0] = v;
    }

    fn u32(&mut self, v: u32) {
        LittleEndian::write_u32(self.slot(4), v);
    }

    fn f32(&mut self, v: f32) {
        LittleEndian::write_f32(self.slot(4), v);
    }
}

/// 方策・平面・補助バイト・勝敗（全バージョン共通の並び）
fn read_body(r: &mut Reader<'_>, meta: RecordMeta) -> Result<Record, MalformedRecord> {
    let mut record = Record::zeroed(meta);

    LittleEndian::read_f32_into(r.take(POLICY_BYTES), &mut record.probabilities[..]);
    if record.probabilities.iter().any(|p| !p.is_finite()) {
        return Err(MalformedRecord::NonFinite {
            field: "probabilities",
        });
    }
    LittleEndian::read_u64_into(r.take(PLANE_BYTES), &mut record.planes[..]);

    record.castling = Castling {
        us_ooo: r.u8(),
        us_oo: r.u8(),
        them_ooo: r.u8(),
        them_oo: r.u8(),
    };
    record.side_to_move = r.u8();
    record.rule50_count = r.u8();
    record.move_count = r.u8();
    record.result = r.u8() as i8;
    Ok(record)
}

fn write_body(w: &mut Writer<'_>, record: &Record) {
    LittleEndian::write_f32_into(&record.probabilities[..], w.slot(POLICY_BYTES));
    LittleEndian::write_u64_into(&record.planes[..], w.slot(PLANE_BYTES));
    w.u8(record.castling.us_ooo);
    w.u8(record.castling.us_oo);
    w.u8(record.castling.them_ooo);
    w.u8(record.castling.them_oo);
    w.u8(record.side_to_move);
    w.u8(record.rule50_count);
    w.u8(record.move_count);
    w.u8(record.result as u8);
}

fn read_q(r: &mut Reader<'_>) -> Result<SearchQ, MalformedRecord> {
    Ok(SearchQ {
        root_q: r.f32("root_q")?,
        best_q: r.f32("best_q")?,
        root_d: r.f32("root_d")?,
        best_d: r.f32("best_d")?,
    })
}

fn write_q(w: &mut Writer<'_>, q: &SearchQ) {
    w.f32(q.root_q);
    w.f32(q.best_q);
    w.f32(q.root_d);
    w.f32(q.best_d);
}

// ---------------------------------------------------------------------------
// バージョン別レイアウト
// ---------------------------------------------------------------------------

fn decode_v3(bytes: &[u8]) -> Result<Record, MalformedRecord> {
    let mut r = Reader::new(bytes, 4);
    read_body(&mut r, RecordMeta::V3)
}

fn decode_v4(bytes: &[u8]) -> Result<Record, MalformedRecord> {
    let mut r = Reader::new(bytes, 4);
    let mut record = read_body(&mut r, RecordMeta::V3)?;
    record.meta = RecordMeta::V4 { q: read_q(&mut r)? };
    Ok(record)
}

fn decode_v5(bytes: &[u8]) -> Result<Record, MalformedRecord> {
    let mut r = Reader::new(bytes, 4);
    let input_format = InputFormat(r.u32());
    let mut record = read_body(&mut r, RecordMeta::V3)?;
    let q = read_q(&mut r)?;
    let m = MovesLeft {
        root_m: r.f32("root_m")?,
        best_m: r.f32("best_m")?,
        plies_left: r.f32("plies_left")?,
    };
    record.meta = RecordMeta::V5 { input_format, q, m };
    Ok(record)
}

fn encode_v3(record: &Record, out: &mut [u8]) {
    let mut w = Writer::new(out);
    w.u32(FormatVersion::V3.tag());
    write_body(&mut w, record);
}

fn encode_v4(record: &Record, out: &mut [u8]) {
    let mut w = Writer::new(out);
    w.u32(FormatVersion::V4.tag());
    write_body(&mut w, record);
    write_q(&mut w, record.search_q().unwrap_or(&SearchQ::default()));
}

fn encode_v5(record: &Record, out: &mut [u8]) {
    let mut w = Writer::new(out);
    w.u32(FormatVersion::V5.tag());
    w.u32(record.input_format().unwrap_or(InputFormat::CLASSIC).0);
    write_body(&mut w, record);
    write_q(&mut w, record.search_q().unwrap_or(&SearchQ::default()));
    let m = record.moves_left().copied().unwrap_or_default();
    w.f32(m.root_m);
    w.f32(m.best_m);
    w.f32(m.plies_left);
}
