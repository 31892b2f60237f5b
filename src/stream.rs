use anyhow::{Result, bail};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Maximum length of a single protocol line, terminator included.
pub const MAX_LINE_LEN: usize = 4096;

const FILL_CHUNK: usize = 4096;

/// A buffered wrapper around an async transport that supports bounded
/// lookahead with a guaranteed no-bytes-consumed contract.
///
/// `peek` fills an internal buffer without advancing the consumer position,
/// so repeated peeks return identical bytes. The `AsyncRead` implementation
/// drains the buffered lookahead first, meaning a stream handed onward after
/// sniffing replays the peeked bytes to its new owner. Line-oriented helpers
/// (`read_line`/`write_line`) cover the STARTTLS phase, which consumes its
/// input before any sniffing happens.
pub struct PeekStream<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Number of bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Advances the consumer position over `n` previously peeked bytes.
    ///
    /// Panics if fewer than `n` bytes are buffered; callers only discard
    /// what an earlier `peek` returned.
    pub fn discard(&mut self, n: usize) {
        assert!(n <= self.buffered(), "discard past peeked bytes");
        self.pos += n;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Returns the next `n` bytes without consuming them.
    ///
    /// Fails with `UnexpectedEof` if the transport ends before `n` bytes are
    /// available; the bytes that did arrive stay buffered for later
    /// consumers.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered() < n {
            self.fill().await?;
        }
        Ok(&self.buf[self.pos..self.pos + n])
    }

    /// Consumes one line, stripping the trailing CR-LF (or lone LF).
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(idx) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let mut line = &self.buf[self.pos..self.pos + idx];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                let Ok(text) = std::str::from_utf8(line) else {
                    bail!("line is not valid UTF-8");
                };
                let text = text.to_owned();
                self.discard(idx + 1);
                return Ok(text);
            }
            if self.buffered() > MAX_LINE_LEN {
                bail!("line longer than {MAX_LINE_LEN} bytes");
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; FILL_CHUNK];
        let read = self.inner.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended while filling lookahead buffer",
            ));
        }
        self.buf.extend_from_slice(&chunk[..read]);
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> PeekStream<S> {
    /// Writes one CR-LF framed line and flushes.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\r\n").await?;
        self.inner.flush().await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let available = &this.buf[this.pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.discard(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
