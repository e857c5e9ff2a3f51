//! Fixed-size framing of the raw audio byte stream.
//!
//! The transcription server expects audio in frames of a fixed byte size, so
//! incoming track frames of arbitrary length are re-sliced here before they
//! are converted and sent.

/// Accumulates raw PCM bytes and slices them into fixed-size chunks.
///
/// Bytes that do not fill a whole chunk are carried over to the next call;
/// the buffer therefore never holds more than `frame_size - 1` bytes between
/// calls. Only [`ChunkBuffer::flush`] may emit a shorter remainder, once, at
/// stream end.
#[derive(Debug)]
pub struct ChunkBuffer {
    frame_size: usize,
    buf: Vec<u8>,
}

impl ChunkBuffer {
    /// Create a buffer emitting chunks of `frame_size` bytes.
    ///
    /// `frame_size` must be non-zero.
    pub fn new(frame_size: usize) -> Self {
        debug_assert!(frame_size > 0, "frame_size must be non-zero");
        Self {
            frame_size,
            buf: Vec::with_capacity(frame_size),
        }
    }

    /// Append `data` and return every complete chunk now available, in FIFO
    /// order. Each returned chunk is exactly `frame_size` bytes.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(data);

        let mut chunks = Vec::new();
        while self.buf.len() >= self.frame_size {
            let rest = self.buf.split_off(self.frame_size);
            chunks.push(std::mem::replace(&mut self.buf, rest));
        }

        chunks
    }

    /// Drain the partial remainder, if any. Called once at stream end.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Bytes currently carried over.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
