//! Connection wrapper that paces writes to its live share of the listener budget.
//!
//! A [`ThrottledConn`] is what [`ThrottledListener::accept`](crate::listener::ThrottledListener::accept)
//! hands out. It is a drop-in `AsyncRead`/`AsyncWrite` stream:
//! - every write first waits out the delay owed for the previous one, then recomputes the
//!   connection's share from the listener state (a short, non-blocking critical section) and runs
//!   through a freshly sized [`ThrottledWriter`];
//! - flush and shutdown wait out the owed delay too, reads go straight to the wrapped stream;
//! - shutting down (or dropping) the connection gives its share back to the others, exactly once.
//!
//! [`ThrottledConn::standalone`] builds a connection with only a per-connection cap and no
//! listener-wide coordination.
use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    config::normalize,
    listener::{ConnSlot, Shares},
    throttler::ThrottledWriter,
};

/// A write-throttled connection.
#[pin_project]
pub struct ThrottledConn<T> {
    // `None` once closed.
    #[pin]
    inner: Option<ThrottledWriter<T>>,
    origin_bandwidth: i64,
    current_bandwidth: i64,
    slot: Option<ConnSlot>,
    cancel: CancellationToken,
}

impl<T> ThrottledConn<T> {
    pub(crate) fn accepted(
        io: T,
        bandwidth: i64,
        slot: ConnSlot,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Some(ThrottledWriter::with_cancel(io, bandwidth, cancel.clone())),
            origin_bandwidth: bandwidth,
            current_bandwidth: bandwidth,
            slot: Some(slot),
            cancel,
        }
    }

    /// Throttle an already accepted connection to `bandwidth` bytes per second without any
    /// server-wide budget. Negative values fall back to
    /// [`DEFAULT_BANDWIDTH`](crate::config::DEFAULT_BANDWIDTH).
    pub fn standalone(io: T, bandwidth: i64) -> Self {
        let bandwidth = normalize(bandwidth);
        let shares = Arc::new(Shares::new(0, bandwidth));
        Self::accepted(
            io,
            bandwidth,
            ConnSlot::acquire(shares),
            CancellationToken::new(),
        )
    }

    /// Bandwidth this connection gets when it is alone.
    #[inline]
    pub fn origin_bandwidth(&self) -> i64 {
        self.origin_bandwidth
    }

    /// Share used by the most recent write.
    #[inline]
    pub fn bandwidth(&self) -> i64 {
        self.current_bandwidth
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Abort a pending throttle delay and stop throttling this connection.
    pub fn cancel_throttling(&self) {
        self.cancel.cancel();
    }

    /// The wrapped stream, unless the connection was closed.
    pub fn get_ref(&self) -> Option<&T> {
        self.inner.as_ref().map(ThrottledWriter::get_ref)
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.inner.as_mut().map(ThrottledWriter::get_mut)
    }

    /// Close the connection. Calling it again is a no-op.
    pub async fn close(&mut self) -> io::Result<()>
    where
        T: AsyncWrite + Unpin,
    {
        self.shutdown().await
    }
}

impl<T: AsyncWrite> ThrottledConn<T> {
    fn poll_throttled<F>(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        write: F,
    ) -> Poll<io::Result<usize>>
    where
        F: FnOnce(Pin<&mut ThrottledWriter<T>>, &mut Context<'_>) -> Poll<io::Result<usize>>,
    {
        let this = self.project();
        let Some(mut writer) = this.inner.as_pin_mut() else {
            return Poll::Ready(Err(closed()));
        };

        ready!(writer.as_mut().poll_ready(cx));

        let share = match this.slot {
            Some(slot) => slot.fair_share(*this.origin_bandwidth),
            None => *this.origin_bandwidth,
        };
        if share != *this.current_bandwidth {
            trace!(
                from = *this.current_bandwidth,
                to = share,
                "connection share changed"
            );
        }
        *this.current_bandwidth = share;
        writer.as_mut().set_bandwidth(share);

        write(writer, cx)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "throttled connection is closed")
}

impl<T: AsyncWrite> AsyncWrite for ThrottledConn<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_throttled(cx, |writer, cx| writer.poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.poll_throttled(cx, |writer, cx| writer.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|writer| writer.is_write_vectored())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project().inner.as_pin_mut() {
            Some(writer) => writer.poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        let res = match this.inner.as_mut().as_pin_mut() {
            Some(writer) => ready!(writer.poll_shutdown(cx)),
            None => return Poll::Ready(Ok(())),
        };

        // The share is returned whatever the shutdown outcome.
        this.inner.set(None);
        this.slot.take();
        Poll::Ready(res)
    }
}

impl<T: AsyncRead> AsyncRead for ThrottledConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project().inner.as_pin_mut() {
            Some(writer) => writer.poll_read(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }
}

impl<T: AsyncBufRead> AsyncBufRead for ThrottledConn<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        match self.project().inner.as_pin_mut() {
            Some(writer) => writer.poll_fill_buf(cx),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        if let Some(writer) = self.project().inner.as_pin_mut() {
            writer.consume(amt);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ThrottledConn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledConn")
            .field("inner", &self.inner)
            .field("origin_bandwidth", &self.origin_bandwidth)
            .field("current_bandwidth", &self.current_bandwidth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{
        tests::{accept_n, MockListener},
        ThrottledListener,
    };
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::{self, Duration, Instant};

    #[tokio::test(start_paused = true)]
    async fn shares_shrink_and_recover_with_connection_count() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 4096).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 4).await;

        for (conn, _) in conns.iter_mut() {
            conn.write_all(b"x").await.unwrap();
            assert_eq!(conn.bandwidth(), 1024);
        }

        for (mut conn, _) in conns.drain(1..) {
            conn.close().await.unwrap();
        }
        assert_eq!(ln.active_connections(), 1);

        let (last, _) = &mut conns[0];
        last.write_all(b"x").await.unwrap();
        assert_eq!(last.bandwidth(), 4096);
    }

    #[tokio::test(start_paused = true)]
    async fn write_is_paced_to_current_share() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 4096).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 2).await;
        let (mut conn, mut client) = conns.remove(0);

        // Two live connections: 2048 B/s each.
        let start = Instant::now();
        conn.write_all(&[1u8; 2048]).await.unwrap();
        conn.flush().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        let mut buf = vec![0u8; 2048];
        client.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|b| *b == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_server_keeps_origin_bandwidth() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 0, 2048).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 8).await;

        for (conn, _) in conns.iter_mut() {
            conn.write_all(b"x").await.unwrap();
            assert_eq!(conn.bandwidth(), 2048);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_conn_bandwidth_is_not_throttled() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 0).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 2).await;
        let (conn, _client) = &mut conns[0];

        let start = Instant::now();
        conn.write_all(&[0u8; 16 * 1024]).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(conn.bandwidth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn double_close_releases_once() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 1024).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 2).await;
        assert_eq!(ln.active_connections(), 2);

        let (conn, _) = &mut conns[0];
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(ln.active_connections(), 1);

        conn.close().await.unwrap();
        assert_eq!(ln.active_connections(), 1);

        drop(conns);
        assert_eq!(ln.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn io_after_close_is_rejected() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 1024).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 1).await;
        let (conn, _) = &mut conns[0];
        conn.close().await.unwrap();

        let err = conn.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(conn.get_ref().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_returns_error_without_delay() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 1).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 1).await;
        let (mut conn, client) = conns.remove(0);
        drop(client);

        let start = Instant::now();
        let err = conn.write(&[0u8; 1024]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_pass_through() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 16, 16).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 1).await;
        let (conn, client) = &mut conns[0];

        client.write_all(&[9u8; 1024]).await.unwrap();
        let start = Instant::now();
        let mut buf = vec![0u8; 1024];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_conn_uses_its_own_cap() {
        let (server, mut client) = duplex(8192);
        let mut conn = ThrottledConn::standalone(server, 512);

        let start = Instant::now();
        conn.write_all(&[0u8; 1024]).await.unwrap();
        conn.flush().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(conn.bandwidth(), 512);

        let mut buf = vec![0u8; 1024];
        client.read_exact(&mut buf).await.unwrap();

        let conn = ThrottledConn::standalone(duplex(8).0, -7);
        assert_eq!(conn.origin_bandwidth(), crate::config::DEFAULT_BANDWIDTH);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_cancel_releases_owed_delays() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 1024, 1024).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 1).await;
        let (conn, _client) = &mut conns[0];

        let start = Instant::now();
        assert_eq!(conn.write(&[0u8; 8192]).await.unwrap(), 8192);
        let (res, _) = tokio::join!(conn.flush(), async {
            time::sleep(Duration::from_millis(300)).await;
            ln.cancel_throttling();
        });
        res.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        // Later writes go through unthrottled.
        conn.write_all(&[0u8; 8192]).await.unwrap();
        conn.flush().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn next_write_waits_for_previous_delay() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 1024).unwrap();
        let mut conns = accept_n(&mut ln, &tx, 1).await;
        let (conn, _client) = &mut conns[0];

        let start = Instant::now();
        conn.write_all(&[0u8; 1024]).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        conn.write_all(b"x").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    /// Accepts every write, fails on shutdown.
    #[derive(Debug)]
    struct FailingShutdown;

    impl AsyncWrite for FailingShutdown {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("shutdown failed")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_shutdown_still_releases_share() {
        let (ln, tx) = MockListener::channel();
        let mut ln = ThrottledListener::new(ln, 4096, 1024).unwrap();
        tx.send(FailingShutdown).unwrap();
        tx.send(FailingShutdown).unwrap();
        let (mut conn, ()) = ln.accept().await.unwrap();
        let (_other, ()) = ln.accept().await.unwrap();
        assert_eq!(ln.active_connections(), 2);

        conn.write_all(b"bye").await.unwrap();
        let err = conn.close().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(conn.is_closed());
        assert_eq!(ln.active_connections(), 1);

        conn.close().await.unwrap();
        assert_eq!(ln.active_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn share_is_recomputed_on_concurrent_tasks() {
        let (ln, tx) = MockListener::new();
        let mut ln = ThrottledListener::new(ln, 4096, 4096).unwrap();
        let conns = accept_n(&mut ln, &tx, 4).await;

        let mut handles = Vec::new();
        for (mut conn, client) in conns {
            handles.push(tokio::spawn(async move {
                conn.write_all(&[0u8; 1024]).await.unwrap();
                let share = conn.bandwidth();
                conn.close().await.unwrap();
                drop(client);
                share
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1024);
        }
        assert_eq!(ln.active_connections(), 0);
    }
}
