//! Tabular file reading (CSV and XLSX)
//!
//! CSV is streamed record by record; the delimiter is sniffed from the header line.
//! XLSX sheets are decoded by calamine as one range. Both are exposed as the same
//! row iterator: headers first, then data rows padded or truncated to the header
//! width. A data row is numbered by its position below the header; blank rows keep
//! their position but are not yielded. Everything here is blocking and runs on the
//! blocking pool when called from workers.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Cursor, Read};

use anyhow::{anyhow, Context, Result};
use calamine::{Data, Reader, Xlsx};

use crate::error::ImportError;
use crate::types::FileKind;

const CSV_BUFFER_BYTES: usize = 64 * 1024;
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const ZIP_MAGIC: &[u8] = &[0x50, 0x4B, 0x03, 0x04];
const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";


/// Decide the file kind from name, declared content type and leading bytes
pub fn detect_kind(file_name: &str, content_type: Option<&str>, bytes: &[u8]) -> Result<FileKind, ImportError> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".xlsx") {
        return Ok(FileKind::Xlsx);
    }
    if lower.ends_with(".csv") || lower.ends_with(".txt") {
        return Ok(FileKind::Csv);
    }

    match content_type.map(|c| c.split(';').next().unwrap_or("").trim().to_lowercase()) {
        Some(ct) if ct == XLSX_CONTENT_TYPE => return Ok(FileKind::Xlsx),
        Some(ct) if ct == "text/csv" || ct == "text/plain" => return Ok(FileKind::Csv),
        _ => {}
    }

    if bytes.starts_with(ZIP_MAGIC) {
        return Ok(FileKind::Xlsx);
    }

    Err(ImportError::UnsupportedFile(format!(
        "'{}' is neither CSV nor XLSX",
        file_name
    )))
}

/// Headers plus up to `limit` sample rows
pub fn preview(kind: FileKind, reader: Box<dyn Read + Send>, limit: usize) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut sheet = SheetReader::open(kind, reader)?;
    let mut samples = Vec::with_capacity(limit);
    while samples.len() < limit {
        match sheet.next_row()? {
            Some((_, row)) => samples.push(row),
            None => break,
        }
    }
    Ok((sheet.headers, samples))
}

/// Number of non-blank data rows, streamed
pub fn count_rows(kind: FileKind, reader: Box<dyn Read + Send>) -> Result<i64> {
    let mut sheet = SheetReader::open(kind, reader)?;
    let mut count = 0;
    while sheet.next_row()?.is_some() {
        count += 1;
    }
    Ok(count)
}

enum RowSource {
    Csv {
        reader: csv::Reader<BufReader<Terminated<Box<dyn Read + Send>>>>,
        record: csv::ByteRecord,
    },
    Sheet(std::vec::IntoIter<Vec<String>>),
}

/// Header row plus a stream of data rows numbered from 1
pub struct SheetReader {
    headers: Vec<String>,
    source: RowSource,
    position: i64,
}

impl SheetReader {
    pub fn open(kind: FileKind, reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut source = match kind {
            FileKind::Csv => open_csv(reader)?,
            FileKind::Xlsx => open_xlsx(reader)?,
        };

        let headers = match next_raw(&mut source)? {
            Some((raw, _)) => unique_headers(raw),
            None => Vec::new(),
        };

        Ok(Self {
            headers,
            source,
            position: 0,
        })
    }

    /// Next non-blank data row with its 1-based position below the header
    pub fn next_row(&mut self) -> Result<Option<(i64, Vec<String>)>> {
        let width = self.headers.len();
        loop {
            let Some((mut row, span)) = next_raw(&mut self.source)? else {
                return Ok(None);
            };
            self.position += span;
            if row.iter().all(|v| v.trim().is_empty()) {
                continue;
            }
            row.resize(width, String::new());
            return Ok(Some((self.position, row)));
        }
    }
}

/// One chunk of data rows
#[derive(Debug, Clone)]
pub struct RawChunk {
    /// 1-based
    pub chunk_number: i64,
    pub rows: Vec<(i64, Vec<String>)>,
}

/// Splits a sheet into fixed-size chunks
pub struct ChunkReader {
    sheet: SheetReader,
    chunk_size: usize,
    next_chunk_number: i64,
    pending: Option<(i64, Vec<String>)>,
}

impl ChunkReader {
    pub fn new(sheet: SheetReader, chunk_size: usize) -> Self {
        Self {
            sheet,
            chunk_size: chunk_size.max(1),
            next_chunk_number: 1,
            pending: None,
        }
    }

    /// Continue after `completed` checkpointed chunks ending at `last_row_number`.
    /// The chunk size of the earlier run does not matter.
    pub fn resume_after(&mut self, completed: i64, last_row_number: i64) -> Result<()> {
        self.next_chunk_number = completed.max(0) + 1;
        while let Some(row) = self.sheet.next_row()? {
            if row.0 > last_row_number {
                self.pending = Some(row);
                break;
            }
        }
        Ok(())
    }

    pub fn next_chunk(&mut self) -> Result<Option<RawChunk>> {
        let mut rows = Vec::with_capacity(self.chunk_size);
        rows.extend(self.pending.take());
        while rows.len() < self.chunk_size {
            match self.sheet.next_row()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let chunk = RawChunk {
            chunk_number: self.next_chunk_number,
            rows,
        };
        self.next_chunk_number += 1;
        Ok(Some(chunk))
    }
}

// =============================================================================
// CSV
// =============================================================================

fn open_csv(reader: Box<dyn Read + Send>) -> Result<RowSource> {
    let mut buffered = BufReader::with_capacity(CSV_BUFFER_BYTES, Terminated::new(reader));

    let head = buffered.fill_buf().context("Failed to read CSV")?;
    let bom = head.starts_with(UTF8_BOM);
    let delimiter = sniff_delimiter(if bom { &head[UTF8_BOM.len()..] } else { head });
    if bom {
        buffered.consume(UTF8_BOM.len());
    }

    let reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(buffered);

    Ok(RowSource::Csv {
        reader,
        record: csv::ByteRecord::new(),
    })
}

/// Ends the input with a line break in the file's own style when the last line
/// lacks one, so the final record advances the line count like every other
struct Terminated<R> {
    inner: R,
    prev: Option<u8>,
    crlf: Option<bool>,
    eof: bool,
    tail: &'static [u8],
}

impl<R> Terminated<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            prev: None,
            crlf: None,
            eof: false,
            tail: b"",
        }
    }
}

impl<R: Read> Read for Terminated<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.eof {
            let n = self.inner.read(buf)?;
            if n > 0 {
                for &b in &buf[..n] {
                    if b == b'\n' && self.crlf.is_none() {
                        self.crlf = Some(self.prev == Some(b'\r'));
                    }
                    self.prev = Some(b);
                }
                return Ok(n);
            }
            self.eof = true;
            self.tail = match self.prev {
                None | Some(b'\n') | Some(b'\r') => b"",
                Some(_) if self.crlf == Some(true) => b"\r\n",
                Some(_) => b"\n",
            };
        }
        let n = self.tail.len().min(buf.len());
        buf[..n].copy_from_slice(&self.tail[..n]);
        self.tail = &self.tail[n..];
        Ok(n)
    }
}

/// Pick the candidate that occurs most often in the first line, outside quotes
fn sniff_delimiter(head: &[u8]) -> u8 {
    const CANDIDATES: [u8; 3] = [b',', b';', b'\t'];

    let mut counts = [0usize; 3];
    let mut in_quotes = false;
    for &b in head {
        match b {
            b'"' => in_quotes = !in_quotes,
            b'\n' | b'\r' if !in_quotes => break,
            _ if !in_quotes => {
                if let Some(i) = CANDIDATES.iter().position(|c| *c == b) {
                    counts[i] += 1;
                }
            }
            _ => {}
        }
    }

    let (best, count) = counts
        .iter()
        .enumerate()
        .max_by_key(|(i, c)| (**c, std::cmp::Reverse(*i)))
        .map(|(i, c)| (CANDIDATES[i], *c))
        .unwrap_or((b',', 0));

    if count == 0 {
        b','
    } else {
        best
    }
}

// =============================================================================
// XLSX
// =============================================================================

fn open_xlsx(mut reader: Box<dyn Read + Send>) -> Result<RowSource> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).context("Failed to read XLSX")?;

    let mut workbook = Xlsx::new(Cursor::new(bytes)).map_err(|e| anyhow!("Invalid XLSX file: {}", e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("XLSX file has no worksheet"))?
        .map_err(|e| anyhow!("Failed to read worksheet: {}", e))?;

    let rows: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect();

    Ok(RowSource::Sheet(rows.into_iter()))
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

// =============================================================================
// Shared
// =============================================================================

/// Next raw record and the number of file rows it advanced, counting the empty
/// lines the CSV reader drops before it. Line breaks inside quoted values do not
/// advance the position.
fn next_raw(source: &mut RowSource) -> Result<Option<(Vec<String>, i64)>> {
    match source {
        RowSource::Csv { reader, record } => {
            let before = reader.position().line();
            if !reader.read_byte_record(record).context("Malformed CSV record")? {
                return Ok(None);
            }
            let lines = reader.position().line().saturating_sub(before);
            let embedded = record.as_slice().iter().filter(|b| **b == b'\n').count() as u64;
            let span = lines.saturating_sub(embedded).max(1) as i64;
            Ok(Some((
                record
                    .iter()
                    .map(|field| String::from_utf8_lossy(field).into_owned())
                    .collect(),
                span,
            )))
        }
        RowSource::Sheet(rows) => Ok(rows.next().map(|row| (row, 1))),
    }
}

/// Trim, name empty headers by position and suffix repeats
fn unique_headers(raw: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, h)| {
            let base = match h.trim() {
                "" => format!("Column {}", i + 1),
                trimmed => trimmed.to_string(),
            };
            let n = seen.entry(base.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                base
            } else {
                format!("{} ({})", base, n)
            }
        })
        .collect()
}
