use crate::IngestResult;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::Transcoder;

/// Read buffer in front of the (optional) decompressor.
const READ_BUFFER: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct SourceMeta {
    /// e.g. "application/gzip" or "text/csv"
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// upload filename, used for extension fallback
    pub name_hint: String,
    /// Which character encoding to expect (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
}

impl Default for SourceMeta {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: String::new(),
            name_hint: String::new(),
            charset: encoding_rs::UTF_8,
        }
    }
}

impl SourceMeta {
    /// Lightweight meta guessed from a file name's extension.
    pub fn from_name(name: &str) -> Self {
        let mut meta = Self {
            name_hint: name.to_string(),
            ..Default::default()
        };
        match Path::new(name).extension().and_then(|s| s.to_str()) {
            Some("gz") => {
                meta.content_type = "application/gzip".into();
                meta.content_encoding = "gzip".into();
            }
            Some("zst") => {
                meta.content_type = "application/zstd".into();
                meta.content_encoding = "zstd".into();
            }
            _ => {
                meta.content_type = "text/csv".into();
            }
        }
        meta
    }

    fn is_gzip(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        let ct = self.content_type.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "gzip")
            || matches!(ct.as_str(), "application/gzip" | "application/x-gzip")
            || self.name_hint.ends_with(".gz")
    }

    fn is_zstd(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "zstd")
            || self.content_type.eq_ignore_ascii_case("application/zstd")
            || self.name_hint.ends_with(".zst")
    }
}

/// Counters shared between the source adapters and the job that drains them.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    bytes_received: Arc<AtomicU64>,
    replaced_sequences: Arc<AtomicU64>,
}

impl SourceStats {
    /// Raw bytes pulled from the underlying stream (before decompression).
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Transcoded chunks that contained malformed input.
    pub fn replaced_sequences(&self) -> u64 {
        self.replaced_sequences.load(Ordering::Relaxed)
    }
}

struct CountingReader<R> {
    inner: R,
    bytes: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let read = buf.filled().len() - before;
            self.bytes.fetch_add(read as u64, Ordering::Relaxed);
        }
        polled
    }
}

/// From a generic AsyncRead, wrap with byte counting, optional decompression
/// and UTF-8 transcoding.
pub fn open_source<R>(raw: R, meta: &SourceMeta) -> (Box<dyn AsyncRead + Unpin + Send>, SourceStats)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stats = SourceStats::default();
    let counted = CountingReader {
        inner: raw,
        bytes: stats.bytes_received.clone(),
    };

    // 1) decompression choice: encoding -> type -> extension
    let buf = BufReader::with_capacity(READ_BUFFER, counted);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = if meta.is_gzip() {
        Box::new(GzipDecoder::new(buf))
    } else if meta.is_zstd() {
        Box::new(ZstdDecoder::new(buf))
    } else {
        Box::new(buf)
    };

    // 2) transcoding only when charset != UTF-8 to avoid extra copies
    let reader: Box<dyn AsyncRead + Unpin + Send> = if meta.charset == encoding_rs::UTF_8 {
        decompressed
    } else {
        let transcoder = Transcoder::new(meta.charset, stats.replaced_sequences.clone());
        Box::new(StreamReader::new(FramedRead::new(decompressed, transcoder)))
    };

    (reader, stats)
}

/// A byte stream ready to be imported, plus what is known about it up front.
pub struct ImportSource {
    pub(crate) reader: Box<dyn AsyncRead + Unpin + Send>,
    pub(crate) stats: SourceStats,
    pub(crate) meta: SourceMeta,
    pub(crate) declared_size: Option<u64>,
    pub(crate) expected_rows: Option<u64>,
}

impl ImportSource {
    pub fn new<R>(raw: R, meta: SourceMeta) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (reader, stats) = open_source(raw, &meta);
        Self {
            reader,
            stats,
            meta,
            declared_size: None,
            expected_rows: None,
        }
    }

    /// In-memory source, mostly useful for tests and small uploads.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(io::Cursor::new(data), SourceMeta::from_name("upload.csv")).with_declared_size(size)
    }

    /// Open a local file; compression is guessed from the extension.
    pub async fn from_path(path: &Path) -> IngestResult<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        Ok(Self::new(file, SourceMeta::from_name(name)).with_declared_size(size))
    }

    pub fn with_declared_size(mut self, bytes: u64) -> Self {
        self.declared_size = Some(bytes);
        self
    }

    /// Known number of data rows, used as the percentage denominator.
    pub fn with_expected_rows(mut self, rows: u64) -> Self {
        self.expected_rows = Some(rows);
        self
    }

    pub fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }
}
