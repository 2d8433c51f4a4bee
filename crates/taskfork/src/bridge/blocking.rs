//! Blocking adapter that drives the frame codecs over `std::io` streams.
//!
//! The controller reads on one dedicated thread and writes from whichever
//! thread is submitting, so it uses plain blocking sockets instead of a
//! runtime. Framing is identical to the worker's `FramedRead`/`FramedWrite`.

use std::io::{self, Read, Write};

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

const READ_CHUNK: usize = 8 * 1024;

/// Reads whole frames from a blocking stream.
///
/// Single reader per stream: the internal buffer holds partially received frames.
pub struct FrameReader<R, D> {
    inner: R,
    codec: D,
    buf: BytesMut,
}

impl<R: Read, D: Decoder<Error = io::Error>> FrameReader<R, D> {
    pub fn new(inner: R, codec: D) -> Self {
        Self {
            inner,
            codec,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Blocks until one full frame is available.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames, and an
    /// `UnexpectedEof` error if the stream ends inside a frame.
    pub fn read_frame(&mut self) -> io::Result<Option<D::Item>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            let n = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes buffered)", self.buf.len()),
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes whole frames to a blocking stream, flushing after each one.
///
/// Not synchronized: callers sharing a writer must hold a lock around `send`
/// so frames from different threads never interleave.
pub struct FrameWriter<W, E> {
    inner: W,
    codec: E,
    buf: BytesMut,
}

impl<W: Write, E> FrameWriter<W, E> {
    pub fn new(inner: W, codec: E) -> Self {
        Self {
            inner,
            codec,
            buf: BytesMut::new(),
        }
    }

    pub fn send<T>(&mut self, item: T) -> io::Result<()>
    where
        E: Encoder<T, Error = io::Error>,
    {
        self.buf.clear();
        self.codec.encode(item, &mut self.buf)?;
        self.inner.write_all(&self.buf)?;
        self.inner.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}
