//! Async frame reader over any byte stream.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Frame, FrameBuffer};
use crate::error::{Result, RiiError};

/// Read buffer size per syscall.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Pulls complete frames off a reader, one at a time.
///
/// `next_frame` is cancel-safe: frames already extracted from the buffer
/// stay queued if the future is dropped.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader with the given payload limit.
    pub fn new(reader: R, max_payload_size: u32) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_max_payload(max_payload_size),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends in
    /// the middle of a frame is reported as `UnexpectedEof`.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.has_partial_frame() {
                    return Err(RiiError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream closed inside a frame",
                    )));
                }
                return Ok(None);
            }

            let frames = self.buffer.push(&self.chunk[..n])?;
            self.ready.extend(frames);
        }
    }
}
