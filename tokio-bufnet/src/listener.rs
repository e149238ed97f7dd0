//! Listener wrapper that shares an aggregate bandwidth budget across its connections.
//!
//! [`ThrottledListener`] decorates any [`Listener`]. Every accepted stream comes back as a
//! [`ThrottledConn`] that, before each write, asks the listener's shared state for its current
//! fair share:
//! - with an unlimited server (`server_bandwidth == 0`) each connection simply runs at its own cap;
//! - otherwise the aggregate is split evenly across the live connections, unless every live
//!   connection could run at its own cap without breaching the aggregate, in which case it does.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpListener;
//! use tokio_bufnet::listener::ThrottledListener;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! let mut listener = ThrottledListener::new(listener, 64 * 1024, 16 * 1024)?;
//!
//! loop {
//!     let (mut conn, _addr) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = conn.write_all(&[0u8; 32 * 1024]).await; // paced to this connection's share
//!         let _ = conn.shutdown().await;                   // frees the share for the others
//!     });
//! }
//! # }
//! ```
use std::{
    future::poll_fn,
    io,
    sync::Arc,
    task::{ready, Context, Poll},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::{ConfigError, ThrottleConfig},
    conn::ThrottledConn,
    io::Listener,
};

/// Bandwidth budget and live connection count of one listener.
#[derive(Debug)]
pub(crate) struct Shares {
    server_bandwidth: i64,
    conn_bandwidth: i64,
    active: Mutex<usize>,
}

impl Shares {
    pub(crate) fn new(server_bandwidth: i64, conn_bandwidth: i64) -> Self {
        Self {
            server_bandwidth,
            conn_bandwidth,
            active: Mutex::new(0),
        }
    }

    pub(crate) fn active(&self) -> usize {
        *self.active.lock()
    }

    fn open(&self) -> usize {
        let mut active = self.active.lock();
        *active += 1;
        *active
    }

    fn release(&self) -> usize {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        *active
    }

    /// Current share of a connection whose solo cap is `origin`.
    pub(crate) fn fair_share(&self, origin: i64) -> i64 {
        if self.server_bandwidth == 0 {
            return origin;
        }

        let active = self.active.lock();
        let count = (*active).max(1) as i64;
        if count.saturating_mul(origin) <= self.server_bandwidth {
            origin
        } else {
            self.server_bandwidth / count
        }
    }
}

/// One live connection's claim on [`Shares`]; released exactly once, on drop.
#[derive(Debug)]
pub(crate) struct ConnSlot {
    shares: Arc<Shares>,
}

impl ConnSlot {
    pub(crate) fn acquire(shares: Arc<Shares>) -> Self {
        let active = shares.open();
        debug!(active, "throttled connection opened");
        Self { shares }
    }

    #[inline]
    pub(crate) fn fair_share(&self, origin: i64) -> i64 {
        self.shares.fair_share(origin)
    }
}

impl Drop for ConnSlot {
    fn drop(&mut self) {
        let active = self.shares.release();
        debug!(active, "throttled connection closed");
    }
}

/// A [`Listener`] whose accepted connections are write-throttled.
#[derive(Debug)]
pub struct ThrottledListener<L> {
    inner: L,
    shares: Arc<Shares>,
    cancel: CancellationToken,
}

impl<L> ThrottledListener<L> {
    /// Wrap `inner` with an aggregate cap of `server_bandwidth` and a per-connection cap of
    /// `conn_bandwidth`, both in bytes per second.
    ///
    /// Negative values fall back to [`DEFAULT_BANDWIDTH`](crate::config::DEFAULT_BANDWIDTH);
    /// a server bandwidth of `0` disables the aggregate cap.
    ///
    /// # Errors
    /// [`ConfigError::ConnBandwidthExceedsServer`] when the per-connection cap alone exceeds a
    /// limited server cap.
    pub fn new(inner: L, server_bandwidth: i64, conn_bandwidth: i64) -> Result<Self, ConfigError> {
        Self::from_config(inner, &ThrottleConfig::new(server_bandwidth, conn_bandwidth))
    }

    pub fn from_config(inner: L, config: &ThrottleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = config.normalized();

        Ok(Self {
            inner,
            shares: Arc::new(Shares::new(config.server_bandwidth, config.conn_bandwidth)),
            cancel: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn server_bandwidth(&self) -> i64 {
        self.shares.server_bandwidth
    }

    #[inline]
    pub fn conn_bandwidth(&self) -> i64 {
        self.shares.conn_bandwidth
    }

    /// Number of accepted connections not yet closed or dropped.
    pub fn active_connections(&self) -> usize {
        self.shares.active()
    }

    /// Abort pending throttle delays on every connection accepted so far and disable further
    /// ones, e.g. while draining on shutdown.
    pub fn cancel_throttling(&self) {
        self.cancel.cancel();
    }

    #[inline]
    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut L {
        &mut self.inner
    }

    #[inline]
    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: Listener> ThrottledListener<L> {
    pub fn poll_accept(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<(ThrottledConn<L::Io>, L::Addr)>> {
        let (io, addr) = ready!(self.inner.poll_accept(cx))?;
        let slot = ConnSlot::acquire(self.shares.clone());
        let conn = ThrottledConn::accepted(
            io,
            self.shares.conn_bandwidth,
            slot,
            self.cancel.child_token(),
        );
        Poll::Ready(Ok((conn, addr)))
    }

    /// Accept the next connection and register it with the shared budget.
    pub async fn accept(&mut self) -> io::Result<(ThrottledConn<L::Io>, L::Addr)> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    pub fn local_addr(&self) -> io::Result<L::Addr> {
        self.inner.local_addr()
    }
}

impl<L: Listener> Listener for ThrottledListener<L> {
    type Io = ThrottledConn<L::Io>;
    type Addr = L::Addr;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>> {
        ThrottledListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
