//! Token-bucket clock used to pace writes.
//!
//! A [`Limiter`] accumulates the number of bytes a writer has pushed and compares the elapsed time
//! against the time those bytes *should* have taken at the configured rate. When the writer is
//! ahead of schedule the limiter arms a timer for the difference; when it is behind schedule for
//! longer than the stall threshold the accumulated history is discarded so a quiet period is
//! neither credited nor punished later.
//!
//! ```no_run
//! use tokio_bufnet::limiter::Limiter;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut limiter = Limiter::new(1024); // 1 KiB/s
//! limiter.init();
//! limiter.limit(2048, 2048).await; // suspends the task for ~2s
//! assert_eq!(limiter.last_sleep().as_secs(), 2);
//! # }
//! ```
//!
//! ## Under the hood
//! - Time comes from [`tokio::time::Instant`], so tests can run against Tokio's paused clock.
//! - The timer is a boxed [`Sleep`] allocated on first use and re-armed afterwards.
//! - An optional [`CancellationToken`] aborts an armed delay early.
use std::{
    fmt,
    future::poll_fn,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Per-writer bandwidth clock.
///
/// A bandwidth `<= 0` disables the limiter entirely.
pub struct Limiter {
    bandwidth: i64,
    bucket: u64,
    start: Instant,
    initialized: bool,
    last_sleep: Duration,
    // Delay armed by `record` and not yet served.
    pending: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    cancel: Option<CancellationToken>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl Limiter {
    /// Create a limiter targeting `bandwidth` bytes per second.
    pub fn new(bandwidth: i64) -> Self {
        Self {
            bandwidth,
            bucket: 0,
            start: Instant::now(),
            initialized: false,
            last_sleep: Duration::ZERO,
            pending: None,
            sleep: None,
            cancel: None,
            cancelled: None,
        }
    }

    /// Like [`Limiter::new`], but armed delays end early once `token` is cancelled.
    pub fn with_cancel(bandwidth: i64, token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..Self::new(bandwidth)
        }
    }

    /// Target rate in bytes per second.
    #[inline]
    pub fn bandwidth(&self) -> i64 {
        self.bandwidth
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.bandwidth > 0
    }

    /// Bytes accounted since the last reset.
    #[inline]
    pub fn bucket(&self) -> u64 {
        self.bucket
    }

    /// Duration of the last completed delay.
    #[inline]
    pub fn last_sleep(&self) -> Duration {
        self.last_sleep
    }

    /// `true` while a delay is armed and has not been served yet.
    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.pending.is_some()
    }

    /// Start the first accounting epoch. Later calls are no-ops.
    pub fn init(&mut self) {
        if !self.initialized {
            self.reset();
            self.initialized = true;
        }
    }

    /// Start a fresh limiter at `bandwidth`, as if newly constructed.
    ///
    /// The timer allocation and cancellation token are kept.
    pub fn renew(&mut self, bandwidth: i64) {
        self.bandwidth = bandwidth;
        self.bucket = 0;
        self.initialized = false;
        self.last_sleep = Duration::ZERO;
        self.pending = None;
    }

    fn reset(&mut self) {
        self.bucket = 0;
        self.start = Instant::now();
    }

    /// Account `n` freshly written bytes out of a `buf_size` byte buffer.
    ///
    /// Returns the delay that was armed, if the writer got ahead of its rate. The delay must be
    /// served with [`Limiter::poll_sleep`] before the next call.
    pub fn record(&mut self, n: usize, buf_size: usize) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }

        self.bucket = self.bucket.saturating_add(n as u64);

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.start);
        let ideal = ideal_duration(self.bucket, self.bandwidth);

        if let Some(keep) = ideal.checked_sub(elapsed).filter(|keep| !keep.is_zero()) {
            trace!(bucket = self.bucket, ?keep, "arming throttle delay");
            self.arm(now + keep);
            self.pending = Some(keep);
            return Some(keep);
        }

        let stall = stall_threshold(buf_size, self.bandwidth);
        if elapsed > stall {
            trace!(?elapsed, ?stall, "limiter stalled, resetting");
            self.reset();
        }

        None
    }

    /// Drive an armed delay to completion, then close the epoch.
    ///
    /// Returns `Ready` immediately when nothing is armed.
    pub fn poll_sleep(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(keep) = self.pending else {
            return Poll::Ready(());
        };

        if self.poll_cancelled(cx) {
            trace!(?keep, "throttle delay cancelled");
            self.pending = None;
            self.reset();
            return Poll::Ready(());
        }

        if let Some(sleep) = self.sleep.as_mut() {
            ready!(sleep.poll_unpin(cx));
        }

        self.pending = None;
        self.last_sleep = keep;
        self.reset();
        Poll::Ready(())
    }

    /// Account `n` bytes and suspend the task for whatever delay that produces.
    pub async fn limit(&mut self, n: usize, buf_size: usize) {
        if self.record(n, buf_size).is_some() {
            poll_fn(|cx| self.poll_sleep(cx)).await;
        }
    }

    fn arm(&mut self, deadline: Instant) {
        if let Some(sleep) = self.sleep.as_mut() {
            sleep.as_mut().reset(deadline);
            return;
        }
        self.sleep = Some(Box::pin(sleep_until(deadline)));
    }

    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(token) = &self.cancel else {
            return false;
        };
        let cancelled = self
            .cancelled
            .get_or_insert_with(|| Box::pin(token.clone().cancelled_owned()));
        cancelled.poll_unpin(cx).is_ready()
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("bandwidth", &self.bandwidth)
            .field("bucket", &self.bucket)
            .field("start", &self.start)
            .field("initialized", &self.initialized)
            .field("last_sleep", &self.last_sleep)
            .field("pending", &self.pending)
            .finish()
    }
}

/// Time `bucket` bytes take at `bandwidth` bytes per second.
fn ideal_duration(bucket: u64, bandwidth: i64) -> Duration {
    let nanos = bucket as u128 * NANOS_PER_SEC / bandwidth as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// One second plus the whole seconds a full buffer takes at `bandwidth`.
fn stall_threshold(buf_size: usize, bandwidth: i64) -> Duration {
    Duration::from_secs(1 + buf_size as u64 / bandwidth as u64)
}
