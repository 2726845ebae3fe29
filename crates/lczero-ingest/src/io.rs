//! チャンクファイルI/O（gzip対応）
//!
//! 圧縮有無は拡張子ではなく gzip のマジックバイトで判定する。
//! 展開後の長さを先に数えてからレコード単位でストリーム復号するため、
//! ファイル全体をメモリに載せることはない。
//!
//! gzip チャンクは長さの確定 (`ChunkFile::probe`) と復号 (`ChunkFile::records`) で
//! 2回展開するので、展開の CPU コストは1ファイルあたり約2倍になる。
//! gzip 末尾の ISIZE は使わない。複数メンバーのファイルでは最後のメンバーの
//! 長さしか表さず、途中が壊れたファイルも末尾だけ見れば正常に見えるため、
//! 1件も送る前に壊れたファイルを弾くには全体を展開して数える必要がある。

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::cancel::CancelToken;
use crate::codec;
use crate::error::{ChunkErrorKind, ChunkReadError, DecodeError};
use crate::record::{FormatVersion, InputFormat, Record};

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB
const PROBE_BUF_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
}

fn sniff_compression(path: &Path) -> io::Result<Compression> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 2];
    let mut n = 0;
    while n < magic.len() {
        match f.read(&mut magic[n..])? {
            0 => break,
            k => n += k,
        }
    }
    if n == 2 && magic == [0x1F, 0x8B] {
        return Ok(Compression::Gzip);
    }
    let gz_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));
    // 拡張子が .gz でもマジックが無ければ非圧縮として扱う
    if gz_ext && n == 2 {
        log::debug!("{} has a .gz extension but no gzip magic", path.display());
    }
    Ok(Compression::Plain)
}

fn open_reader(path: &Path, compression: Compression) -> io::Result<Box<dyn Read + Send>> {
    let f = File::open(path)?;
    Ok(match compression {
        Compression::Plain => Box::new(BufReader::with_capacity(READER_BUF_CAP, f)),
        Compression::Gzip => Box::new(BufReader::with_capacity(
            READER_BUF_CAP,
            MultiGzDecoder::new(f),
        )),
    })
}

/// 検査済みのチャンクファイル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFile {
    pub path: PathBuf,
    pub compression: Compression,
    pub version: FormatVersion,
    /// 展開後のバイト数
    pub len: u64,
    pub record_count: u64,
}

impl ChunkFile {
    /// ファイルを開いて展開後の長さを数え、バージョンと件数を確定する
    ///
    /// `version` を指定した場合は推定を行わず、割り切れるかだけを検査する。
    pub fn probe(
        path: impl AsRef<Path>,
        version: Option<FormatVersion>,
        cancel: &CancelToken,
    ) -> Result<Self, ChunkReadError> {
        let path = path.as_ref();
        let err = |kind| ChunkReadError::new(path, kind);

        let compression = sniff_compression(path).map_err(|e| err(ChunkErrorKind::Open(e)))?;
        let len = match compression {
            Compression::Plain => std::fs::metadata(path)
                .map_err(|e| err(ChunkErrorKind::Open(e)))?
                .len(),
            Compression::Gzip => {
                let reader =
                    open_reader(path, compression).map_err(|e| err(ChunkErrorKind::Open(e)))?;
                count_bytes(reader, cancel).map_err(err)?
            }
        };

        if len == 0 {
            return Err(err(ChunkErrorKind::Empty));
        }
        let version = match version {
            Some(v) => {
                if len % v.record_size() as u64 != 0 {
                    return Err(err(ChunkErrorKind::NotDivisible {
                        len,
                        version: v,
                        record_size: v.record_size(),
                    }));
                }
                v
            }
            None => codec::detect_version(len).map_err(|e| err(e.into()))?,
        };

        Ok(Self {
            path: path.to_path_buf(),
            compression,
            version,
            len,
            record_count: len / version.record_size() as u64,
        })
    }

    /// レコードを先頭から順に復号するイテレータを返す
    pub fn records(
        &self,
        expected_input_format: Option<InputFormat>,
    ) -> Result<ChunkRecords, ChunkReadError> {
        let reader = open_reader(&self.path, self.compression)
            .map_err(|e| ChunkReadError::new(&self.path, ChunkErrorKind::Open(e)))?;
        Ok(ChunkRecords {
            path: self.path.clone(),
            reader,
            version: self.version,
            expected_input_format,
            buf: vec![0u8; self.version.record_size()],
            index: 0,
            expected: self.record_count,
            done: false,
        })
    }
}

/// 展開しながら長さだけを数える
fn count_bytes(mut reader: impl Read, cancel: &CancelToken) -> Result<u64, ChunkErrorKind> {
    let mut buf = vec![0u8; PROBE_BUF_CAP];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(ChunkErrorKind::Interrupted);
        }
        match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n as u64,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChunkErrorKind::Decompress(e)),
        }
    }
}

/// チャンク内レコードのストリーム
///
/// 個々のレコードの異常は `DecodeError::Record` として返して続行し、
/// 読み取り自体の失敗は `DecodeError::Chunk` を返して終了する。
pub struct ChunkRecords {
    path: PathBuf,
    reader: Box<dyn Read + Send>,
    version: FormatVersion,
    expected_input_format: Option<InputFormat>,
    buf: Vec<u8>,
    index: u64,
    expected: u64,
    done: bool,
}

impl ChunkRecords {
    pub fn version(&self) -> FormatVersion {
        self.version
    }
}

impl Iterator for ChunkRecords {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.index >= self.expected {
            return None;
        }
        if let Err(e) = self.reader.read_exact(&mut self.buf) {
            self.done = true;
            let kind = if e.kind() == ErrorKind::UnexpectedEof {
                ChunkErrorKind::Truncated {
                    read: self.index,
                    expected: self.expected,
                }
            } else {
                ChunkErrorKind::Decompress(e)
            };
            return Some(Err(ChunkReadError::new(&self.path, kind).into()));
        }
        let index = self.index;
        self.index += 1;
        Some(
            codec::decode_checked(&self.buf, self.version, self.expected_input_format)
                .map_err(|source| DecodeError::Record { index, source }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let left = (self.expected - self.index) as usize;
        (0, Some(left))
    }
}

/// チャンクの書き出し口
///
/// gzip の終端処理で起きたエラーを落とさないよう、最後に `close()` を呼ぶこと。
#[must_use = "call .close() to propagate compression/IO errors"]
pub enum ChunkWriter {
    Plain(BufWriter<File>),
    Gz(flate2::write::GzEncoder<BufWriter<File>>),
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ChunkWriter::Plain(f) => f.write(buf),
            ChunkWriter::Gz(e) => e.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            ChunkWriter::Plain(f) => f.flush(),
            ChunkWriter::Gz(e) => e.flush(),
        }
    }
}

impl ChunkWriter {
    pub fn create(path: impl AsRef<Path>, compression: Compression) -> io::Result<Self> {
        let f = BufWriter::new(File::create(path)?);
        Ok(match compression {
            Compression::Plain => ChunkWriter::Plain(f),
            Compression::Gzip => ChunkWriter::Gz(flate2::write::GzEncoder::new(
                f,
                flate2::Compression::default(),
            )),
        })
    }

    pub fn write_record(&mut self, record: &Record) -> io::Result<()> {
        self.write_all(&codec::encode(record))
    }

    pub fn close(self) -> io::Result<()> {
        match self {
            ChunkWriter::Plain(mut f) => f.flush(),
            ChunkWriter::Gz(e) => {
                let mut f = e.finish()?;
                f.flush()
            }
        }
    }
}

/// 同一バージョンのレコード列をチャンクファイルとして書き出す
pub fn write_chunk(
    path: impl AsRef<Path>,
    records: &[Record],
    compression: Compression,
) -> io::Result<()> {
    if let Some(first) = records.first() {
        if records.iter().any(|r| r.version() != first.version()) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "a chunk must hold records of a single format version",
            ));
        }
    }
    let mut w = ChunkWriter::create(path, compression)?;
    for r in records {
        w.write_record(r)?;
    }
    w.close()
}
