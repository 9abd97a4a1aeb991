//! Line decoder: header validation plus a lazy, single-pass sequence of rows.
//!
//! Rows are read with `csv_async::ByteRecord` into one reused buffer, so memory
//! stays at the csv-async buffer (`chunk_size`) plus the header plus one record
//! regardless of how long the input is.
//!
//! csv-async stamps a record with the reader position from before any empty
//! lines it skipped, so physical line numbers come from [`LineTracking`]
//! instead.

use crate::model::{truncate_excerpt, RowError, RowErrorKind};
use crate::{IngestResult, SchemaError};
use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use futures::stream::{self, Stream};
use memchr::memchr2_iter;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Validated header: trimmed, lower-cased column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    /// Validate a raw header record against the required column names.
    pub fn parse(raw: &ByteRecord, required: &[String]) -> Result<Self, SchemaError> {
        if raw.is_empty() || (raw.len() == 1 && raw[0].iter().all(u8::is_ascii_whitespace)) {
            return Err(SchemaError::EmptyHeader);
        }

        let mut columns = Vec::with_capacity(raw.len());
        let mut index = HashMap::with_capacity(raw.len());
        for (i, field) in raw.iter().enumerate() {
            let name = std::str::from_utf8(field).map_err(|_| SchemaError::HeaderEncoding)?;
            let name = if i == 0 {
                name.trim_start_matches('\u{feff}')
            } else {
                name
            };
            let name = name.trim().to_lowercase();
            if name.is_empty() {
                return Err(SchemaError::EmptyColumn(i + 1));
            }
            if index.insert(name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateColumn(name));
            }
            columns.push(name);
        }

        for req in required {
            let req = req.trim().to_lowercase();
            if !index.contains_key(&req) {
                return Err(SchemaError::MissingColumn(req));
            }
        }

        Ok(Self { columns, index })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Case-insensitive column lookup.
    pub fn position(&self, column: &str) -> Option<usize> {
        self.index
            .get(column)
            .or_else(|| self.index.get(&column.to_lowercase()))
            .copied()
    }
}

/// One decoded row's values, addressable by column name.
#[derive(Debug, Clone)]
pub struct FieldMap {
    header: Arc<Header>,
    values: Vec<String>,
}

impl FieldMap {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.header
            .position(column)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    /// `(column, value)` pairs in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.header
            .columns()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }

    pub fn excerpt(&self) -> String {
        truncate_excerpt(&self.values.join(","))
    }
}

/// A data row: either its fields or the reason it could not be decoded.
#[derive(Debug, Clone)]
pub struct DecodedRow {
    /// Non-blank line number, header included (first data row is 2).
    pub ordinal: u64,
    /// Physical line in the source, blank lines included.
    pub line: u64,
    pub fields: Result<FieldMap, RowError>,
}

/// Offsets of `\r` / `\n` bytes handed to the csv reader and not yet passed by it.
#[derive(Debug, Default)]
struct LineIndex {
    /// `(byte offset, is '\n')`, ascending.
    terminators: VecDeque<(u64, bool)>,
    /// `\n` bytes already dropped from the front of `terminators`.
    newlines_before: u64,
}

impl LineIndex {
    /// 1-based physical line of the record whose scan began at byte `start`.
    ///
    /// Everything before `start` is forgotten. The run of terminators right at
    /// `start` is the empty lines csv skipped before the record's first byte.
    fn line_at(&mut self, start: u64) -> u64 {
        while let Some(&(offset, newline)) = self.terminators.front() {
            if offset >= start {
                break;
            }
            self.terminators.pop_front();
            self.newlines_before += newline as u64;
        }

        let mut line = self.newlines_before + 1;
        let mut expected = start;
        for &(offset, newline) in &self.terminators {
            if offset != expected {
                break;
            }
            line += newline as u64;
            expected += 1;
        }
        line
    }
}

/// Feeds the csv reader while noting where line terminators fall.
///
/// Only the csv buffer's worth of bytes is ever ahead of the decoder, so the
/// index stays bounded by `chunk_size`.
struct LineTracking<R> {
    inner: R,
    offset: u64,
    index: Arc<Mutex<LineIndex>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for LineTracking<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let fresh = &buf.filled()[before..];
            let base = self.offset;
            let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            index.terminators.extend(
                memchr2_iter(b'\n', b'\r', fresh).map(|i| (base + i as u64, fresh[i] == b'\n')),
            );
            drop(index);
            self.offset += fresh.len() as u64;
        }
        polled
    }
}

pub struct RowDecoder<R> {
    reader: AsyncReader<LineTracking<R>>,
    lines: Arc<Mutex<LineIndex>>,
    header: Arc<Header>,
    record: ByteRecord,
    ordinal: u64,
}

impl<R> RowDecoder<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read and validate the header. Fails with [`SchemaError`] before any row is produced.
    pub async fn open(reader: R, required: &[String], chunk_size: usize) -> IngestResult<Self> {
        let lines = Arc::new(Mutex::new(LineIndex::default()));
        let tracked = LineTracking {
            inner: reader,
            offset: 0,
            index: lines.clone(),
        };
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .buffer_capacity(chunk_size)
            .create_reader(tracked);

        let header = Header::parse(reader.byte_headers().await?, required)?;

        Ok(Self {
            reader,
            lines,
            header: Arc::new(header),
            record: ByteRecord::new(),
            ordinal: 1,
        })
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    /// Next non-blank row, or `None` at end of input.
    ///
    /// Malformed rows come back as `Err` inside [`DecodedRow::fields`]; only
    /// failures of the underlying reader are returned as errors.
    pub async fn next_row(&mut self) -> IngestResult<Option<DecodedRow>> {
        loop {
            if !self.reader.read_byte_record(&mut self.record).await? {
                return Ok(None);
            }
            let start = self.record.position().map(|p| p.byte()).unwrap_or(0);
            let line = self
                .lines
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .line_at(start);
            if is_blank(&self.record) {
                continue;
            }

            self.ordinal += 1;
            let fields = self.decode_fields(line);
            return Ok(Some(DecodedRow {
                ordinal: self.ordinal,
                line,
                fields,
            }));
        }
    }

    /// The same single forward pass as a `Stream`. The stream ends after the
    /// first reader failure.
    pub fn into_stream(self) -> impl Stream<Item = IngestResult<DecodedRow>> {
        stream::unfold(Some(self), |state| async move {
            let mut decoder = state?;
            match decoder.next_row().await {
                Ok(Some(row)) => Some((Ok(row), Some(decoder))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    fn decode_fields(&self, line: u64) -> Result<FieldMap, RowError> {
        let expected = self.header.len();
        if self.record.len() != expected {
            return Err(RowError::new(
                self.ordinal,
                line,
                lossy_excerpt(&self.record),
                RowErrorKind::ColumnCount,
                format!("expected {} columns, found {}", expected, self.record.len()),
            ));
        }

        let mut values = Vec::with_capacity(expected);
        for (i, field) in self.record.iter().enumerate() {
            match std::str::from_utf8(field) {
                Ok(value) => values.push(value.to_string()),
                Err(_) => {
                    return Err(RowError::new(
                        self.ordinal,
                        line,
                        lossy_excerpt(&self.record),
                        RowErrorKind::Encoding,
                        format!("column '{}' is not valid UTF-8", self.header.columns()[i]),
                    ))
                }
            }
        }

        Ok(FieldMap {
            header: self.header.clone(),
            values,
        })
    }
}

fn is_blank(record: &ByteRecord) -> bool {
    record.is_empty() || (record.len() == 1 && record[0].iter().all(u8::is_ascii_whitespace))
}

fn lossy_excerpt(record: &ByteRecord) -> String {
    let joined = record
        .iter()
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(",");
    truncate_excerpt(&joined)
}
