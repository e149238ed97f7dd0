//! Streams a fixed payload to every client through a throttled listener.
//!
//! ```text
//! RUST_LOG=tokio_bufnet=debug cargo run --example serve
//! # in other terminals
//! nc 127.0.0.1 8080 > /dev/null
//! ```
use std::time::Instant;

use tokio::{io::AsyncWriteExt, net::TcpListener, signal};
use tokio_bufnet::{ThrottleConfig, ThrottledListener};
use tracing::{error, info, Instrument};

const PAYLOAD: usize = 256 * 1024;
const CHUNK: usize = 16 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ThrottleConfig::new(128 * 1024, 64 * 1024);
    let listener = TcpListener::bind("127.0.0.1:8080").await?;
    let mut listener = ThrottledListener::from_config(listener, &config)?;
    info!(
        listen = %listener.local_addr()?,
        server_bandwidth = listener.server_bandwidth(),
        conn_bandwidth = listener.conn_bandwidth(),
        "Listening"
    );

    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((mut conn, addr)) => {
                    let span = tracing::info_span!("conn", client = %addr);
                    tokio::spawn(async move {
                        let start = Instant::now();
                        let chunk = [b'.'; CHUNK];
                        let mut sent = 0;
                        while sent < PAYLOAD {
                            if let Err(e) = conn.write_all(&chunk).await {
                                error!(error = %e, "write failed");
                                break;
                            }
                            sent += CHUNK;
                        }
                        _ = conn.close().await;
                        let secs = start.elapsed().as_secs_f64();
                        info!(sent, secs, rate_bps = sent as f64 / secs, "done");
                    }.instrument(span));
                }
                Err(e) => error!(%e, "accept failed"),
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                listener.cancel_throttling();
                break;
            }
        }
    }

    Ok(())
}
