use bytes::{Buf, BytesMut};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::codec::Decoder;

/// Re-encodes a byte stream in some legacy charset into UTF-8.
///
/// Malformed input is replaced with U+FFFD so the CSV layer still sees whole
/// rows; every chunk that needed a replacement bumps `replaced`.
pub struct Transcoder {
    decoder: encoding_rs::Decoder,
    replaced: Arc<AtomicU64>,
    finished: bool,
}

impl Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding, replaced: Arc<AtomicU64>) -> Self {
        Self {
            decoder: encoding.new_decoder_without_bom_handling(),
            replaced,
            finished: false,
        }
    }

    fn transcode(&mut self, src: &mut BytesMut, last: bool) -> Option<BytesMut> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 4);
        let mut out = BytesMut::zeroed(capacity);

        let (_result, read, written, had_errors) =
            self.decoder.decode_to_utf8(src, &mut out, last);
        src.advance(read);
        if had_errors {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }

        if written == 0 {
            return None;
        }
        out.truncate(written);
        Some(out)
    }
}

impl Decoder for Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        // A trailing partial sequence stays inside the charset decoder's state.
        Ok(self.transcode(src, false))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // The charset decoder must not be fed again once flushed.
        if self.finished {
            buf.clear();
            return Ok(None);
        }
        self.finished = true;
        let out = self.transcode(buf, true);
        buf.clear();
        Ok(out)
    }
}
