//! Transport abstractions and extension traits.
//!
//! [`Listener`] is the accept-side capability the throttling wrappers decorate. It is implemented
//! for Tokio's TCP and Unix listeners and for [`ThrottledListener`] itself, so a throttled listener
//! can be used anywhere its inner listener could.
//!
//! The extension traits bolt the wrappers onto existing values:
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::{TcpListener, TcpStream};
//! use tokio_bufnet::io::{BufNetListenerExt, BufNetWriteExt};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Server side: 1 MiB/s shared, 256 KiB/s per connection.
//! let mut listener = TcpListener::bind("0.0.0.0:9000")
//!     .await?
//!     .throttle(1 << 20, 256 << 10)?;
//! let (mut conn, _) = listener.accept().await?;
//! conn.write_all(b"hello").await?;
//!
//! // Client side: a plain stream with a static cap.
//! let mut stream = TcpStream::connect("127.0.0.1:9000").await?.limit_writes(4096);
//! stream.write_all(b"ping").await?;
//! # Ok(()) }
//! ```
use std::{
    io,
    net::SocketAddr,
    task::{Context, Poll},
};

use tokio::io::AsyncWrite;

use crate::{
    config::{ConfigError, ThrottleConfig},
    listener::ThrottledListener,
    throttler::ThrottledWriter,
};

/// A source of accepted connections.
///
/// Mirrors the `poll_accept`/`local_addr` pair Tokio's listeners expose.
pub trait Listener {
    /// Accepted stream type.
    type Io;
    /// Peer and local address type.
    type Addr;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>>;

    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for tokio::net::TcpListener {
    type Io = tokio::net::TcpStream;
    type Addr = SocketAddr;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>> {
        tokio::net::TcpListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::TcpListener::local_addr(self)
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Io, Self::Addr)>> {
        tokio::net::UnixListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        tokio::net::UnixListener::local_addr(self)
    }
}

/// Listener-side ergonomics.
pub trait BufNetListenerExt: Listener {
    /// Wrap this listener with an aggregate and a per-connection cap (bytes/second).
    ///
    /// See [`ThrottledListener::new`] for the value rules.
    fn throttle(
        self,
        server_bandwidth: i64,
        conn_bandwidth: i64,
    ) -> Result<ThrottledListener<Self>, ConfigError>
    where
        Self: Sized,
    {
        ThrottledListener::new(self, server_bandwidth, conn_bandwidth)
    }

    /// Same as [`throttle`](Self::throttle) with the caps taken from `config`.
    fn throttle_with(self, config: &ThrottleConfig) -> Result<ThrottledListener<Self>, ConfigError>
    where
        Self: Sized,
    {
        ThrottledListener::from_config(self, config)
    }
}

impl<L: Listener> BufNetListenerExt for L {}

/// Write-side ergonomics.
pub trait BufNetWriteExt: AsyncWrite {
    /// Cap this writer at `bandwidth` bytes/second. `<= 0` is pass-through.
    #[must_use]
    fn limit_writes(self, bandwidth: i64) -> ThrottledWriter<Self>
    where
        Self: Sized,
    {
        ThrottledWriter::new(self, bandwidth)
    }
}

impl<T: AsyncWrite> BufNetWriteExt for T {}
