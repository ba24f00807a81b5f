/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const INITIAL_CAPACITY: usize = 8 * 1024;

/// Anything a connection can run over: TCP, TLS, or a test duplex pipe.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Called with every chunk as it arrives from the transport.
pub type RawObserver = Box<dyn FnMut(&[u8]) + Send>;

/// Buffered duplex stream with indexable lookahead.
///
/// Parsers inspect [`ByteStream::buffered`], call [`ByteStream::consume`] for what they
/// used and [`ByteStream::fill`] when they need more. Reads through `AsyncRead` drain the
/// buffer before touching the transport, so a stream can be handed to a TLS acceptor
/// after some of it has been inspected.
pub struct ByteStream {
    inner: BoxedTransport,
    buf: BytesMut,
    capacity: usize,
    observer: Option<RawObserver>,
    eof: bool,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("buffered", &self.buf.len())
            .field("capacity", &self.capacity)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

impl ByteStream {
    pub fn new(inner: impl Transport + 'static, capacity: usize) -> Self {
        Self::from_boxed(Box::new(inner), capacity)
    }

    pub fn from_boxed(inner: BoxedTransport, capacity: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(capacity.max(1))),
            capacity: capacity.max(1),
            observer: None,
            eof: false,
        }
    }

    pub fn set_observer(&mut self, observer: RawObserver) {
        self.observer = Some(observer);
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn peek(&self, index: usize) -> Option<u8> {
        self.buf.get(index).copied()
    }

    /// Discards `n` bytes from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Takes everything currently buffered.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    /// True once the transport reported end of stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Pulls more bytes into the buffer and returns how many arrived.
    ///
    /// Returns 0 at end of stream, and also without reading when the buffer is full.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let room = self.capacity.saturating_sub(self.buf.len());
        if room == 0 || self.eof {
            return Ok(0);
        }
        let start = self.buf.len();
        let n = (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await?;
        if n == 0 {
            self.eof = true;
        } else if let Some(observer) = self.observer.as_mut() {
            observer(&self.buf[start..]);
        }
        Ok(n)
    }

    pub fn into_parts(self) -> (Bytes, BoxedTransport) {
        (self.buf.freeze(), self.inner)
    }
}

impl AsyncRead for ByteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        let this = &mut *self;
        let before = out.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, out);
        if let Poll::Ready(Ok(())) = &polled {
            let fresh = &out.filled()[before..];
            if fresh.is_empty() {
                this.eof = true;
            } else if let Some(observer) = this.observer.as_mut() {
                observer(fresh);
            }
        }
        polled
    }
}

impl AsyncWrite for ByteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
