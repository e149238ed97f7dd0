//! Write-side bandwidth shaping for Tokio listeners and the connections they accept.
//!
//! The crate decorates a listener so that every accepted connection is paced to a fair share of
//! an aggregate budget, never exceeding its own per-connection cap:
//!
//! ```no_run
//! use tokio::io::AsyncWriteExt;
//! use tokio::net::TcpListener;
//! use tokio_bufnet::ThrottledListener;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! // 4 KiB/s for everyone together, at most 1 KiB/s for any single connection.
//! let mut listener = ThrottledListener::new(listener, 4096, 1024)?;
//!
//! loop {
//!     let (mut conn, _) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let _ = conn.write_all(&[0u8; 8192]).await;
//!         let _ = conn.close().await;
//!     });
//! }
//! # }
//! ```
//!
//! Building blocks, leaves first:
//! - [`limiter`]: the token-bucket clock deciding how long a writer must wait.
//! - [`throttler`]: [`ThrottledWriter`], an `AsyncWrite` decorator driven by a limiter.
//! - [`listener`] and [`conn`]: the listener/connection pair sharing one budget.
//! - [`config`]: validated bandwidth settings, [`io`]: the `Listener` trait and extension traits.
//!
//! Only writes are shaped. Reads, flushes and addresses go straight to the wrapped transport, and
//! transport errors are returned untouched.
pub mod config;
pub mod conn;
pub mod io;
pub mod limiter;
pub mod listener;
pub mod throttler;

pub use config::{ConfigError, ThrottleConfig, DEFAULT_BANDWIDTH};
pub use conn::ThrottledConn;
pub use io::{BufNetListenerExt, BufNetWriteExt, Listener};
pub use limiter::Limiter;
pub use listener::ThrottledListener;
pub use throttler::ThrottledWriter;
