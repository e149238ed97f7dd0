//! Write-side throttling for Tokio `AsyncWrite` sinks.
//!
//! [`ThrottledWriter`] forwards every write to the inner sink **first** and then charges the
//! bytes actually written to its [`Limiter`]. If the writer got ahead of the configured rate, the
//! resulting delay is carried as debt: the write itself reports its byte count right away, and the
//! next `write`, `flush` or `shutdown` stays pending until the debt has been served. The caller's
//! task is the only thing that waits; no background timer is spawned.
//!
//! Rates are expressed in **bytes per second**. Any value `<= 0` disables throttling.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_bufnet::throttler::ThrottledWriter;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let mut writer = ThrottledWriter::new(stream, 32 * 1024); // 32 KiB/s
//!
//! writer.write_all(&[0u8; 64 * 1024]).await?;
//! writer.flush().await?; // returns once the 64 KiB have been paced, ~2s
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - A poll that returns `Pending` has written nothing, so dropping a write future (timeouts,
//!   `select!`) never loses or double-reports bytes.
//! - A failed inner write is returned as-is and adds no delay.
//! - Partial writes are charged for the bytes that went through, measured against the full
//!   buffer length for the limiter's stall threshold.
//! - The read side is pass-through.
use std::{
    fmt, io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::limiter::Limiter;

/// A bandwidth-limited writer.
///
/// # Examples
/// ```no_run
/// use tokio::io::{self, duplex, AsyncWriteExt};
/// use tokio_bufnet::throttler::ThrottledWriter;
///
/// # #[tokio::main]
/// # async fn main() -> io::Result<()> {
/// let (mut w, _r) = duplex(128);
/// let mut tw = ThrottledWriter::new(&mut w, 8); // 8 B/s
/// tw.write_all(b"hello").await?;
/// # Ok(()) }
/// ```
#[pin_project]
pub struct ThrottledWriter<W> {
    #[pin]
    inner: W,
    limiter: Limiter,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, bandwidth: i64) -> Self {
        Self {
            inner,
            limiter: Limiter::new(bandwidth),
        }
    }

    /// Same as [`ThrottledWriter::new`], but cancelling `token` aborts any pending delay.
    pub fn with_cancel(inner: W, bandwidth: i64, token: CancellationToken) -> Self {
        Self {
            inner,
            limiter: Limiter::with_cancel(bandwidth, token),
        }
    }

    #[inline]
    pub fn bandwidth(&self) -> i64 {
        self.limiter.bandwidth()
    }

    #[inline]
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// `true` unless a delay from an earlier write is still owed.
    #[inline]
    pub fn is_idle(&self) -> bool {
        !self.limiter.is_sleeping()
    }

    /// Serve the delay owed by earlier writes.
    pub fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.project().limiter.poll_sleep(cx)
    }

    /// Restart the limiter at `bandwidth`, discarding its accounting.
    ///
    /// Ignored while a delay is still owed; serve it with [`poll_ready`](Self::poll_ready) first.
    pub fn set_bandwidth(self: Pin<&mut Self>, bandwidth: i64) {
        let this = self.project();
        if !this.limiter.is_sleeping() {
            this.limiter.renew(bandwidth);
        }
    }

    #[inline]
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    #[inline]
    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut W> {
        self.project().inner
    }

    #[inline]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> ThrottledWriter<W> {
    fn poll_throttled<F>(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        want: usize,
        write: F,
    ) -> Poll<io::Result<usize>>
    where
        F: FnOnce(Pin<&mut W>, &mut Context<'_>) -> Poll<io::Result<usize>>,
    {
        let this = self.project();

        // Nothing is written until the previous debt is paid.
        ready!(this.limiter.poll_sleep(cx));

        if !this.limiter.is_enabled() {
            return write(this.inner, cx);
        }

        this.limiter.init();
        let n = ready!(write(this.inner, cx))?;
        this.limiter.record(n, want);

        Poll::Ready(Ok(n))
    }
}

impl<W: AsyncWrite> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_throttled(cx, buf.len(), |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.limiter.poll_sleep(cx));
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.limiter.poll_sleep(cx));
        this.inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        self.poll_throttled(cx, total, |inner, cx| inner.poll_write_vectored(cx, bufs))
    }
}

impl<W: AsyncRead> AsyncRead for ThrottledWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<W: AsyncBufRead> AsyncBufRead for ThrottledWriter<W> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        self.project().inner.poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.project().inner.consume(amt)
    }
}

impl<W: fmt::Debug> fmt::Debug for ThrottledWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledWriter")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish()
    }
}
