//! Line framing for the serial reader

use std::io;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::MAX_LINE_LENGTH;

/// Splits the incoming byte stream on an arbitrary delimiter sequence.
///
/// Lines are decoded lossily as UTF-8 since sensor firmware occasionally
/// emits garbage right after reset. A line that grows past
/// [`MAX_LINE_LENGTH`] without a delimiter is discarded up to and including
/// its delimiter, however many reads that takes.
#[derive(Debug, Clone)]
pub struct LineCodec {
    delimiter: Vec<u8>,
    max_length: usize,
    /// Offset already searched in the current buffer
    next_index: usize,
    /// Dropping the rest of an overlong line
    discarding: bool,
}

impl LineCodec {
    /// Codec for the given delimiter
    pub fn new(delimiter: &str) -> Self {
        Self::with_max_length(delimiter, MAX_LINE_LENGTH)
    }

    /// Codec with a custom line length cap
    pub fn with_max_length(delimiter: &str, max_length: usize) -> Self {
        Self {
            delimiter: delimiter.as_bytes().to_vec(),
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn find_delimiter(&self, buf: &[u8]) -> Option<usize> {
        let len = self.delimiter.len();
        if len == 0 || buf.len() < len {
            return None;
        }
        // Step back so a delimiter split across two reads is still found
        let start = self.next_index.saturating_sub(len - 1);
        buf[start..]
            .windows(len)
            .position(|w| w == self.delimiter.as_slice())
            .map(|pos| start + pos)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            match self.find_delimiter(buf) {
                Some(pos) => {
                    let line = buf.split_to(pos);
                    buf.advance(self.delimiter.len());
                    self.next_index = 0;
                    if self.discarding {
                        // Tail of an overlong line
                        self.discarding = false;
                        continue;
                    }
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                None if self.discarding || buf.len() > self.max_length => {
                    if !self.discarding {
                        tracing::warn!(
                            "Discarding line longer than {} bytes",
                            self.max_length
                        );
                        self.discarding = true;
                    }
                    // Keep a possible delimiter prefix for the next read
                    let keep = self.delimiter.len().saturating_sub(1).min(buf.len());
                    buf.advance(buf.len() - keep);
                    self.next_index = buf.len();
                    return Ok(None);
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}
