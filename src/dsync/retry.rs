use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures_core::Stream;
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::utils::rng_seed_now;

// MAX_JITTER will randomize over the full exponential backoff time
pub const MAX_JITTER: f64 = 1.0;

// NO_JITTER disables the use of jitter for randomizing the exponential backoff time
pub const NO_JITTER: f64 = 0.0;

// Default retry constants.
pub const DEFAULT_RETRY_UNIT: Duration = Duration::from_secs(1); // 1 second.
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(1); // 1 second.

// Attempts beyond this don't grow the backoff any further.
const MAX_ATTEMPT: u32 = 30;

lazy_static! {
    // Shared by every retry timer in the process.
    static ref GLOBAL_RANDOM_SOURCE: Mutex<StdRng> = Mutex::new(rng_seed_now());
}

fn random_float() -> f64 {
    GLOBAL_RANDOM_SOURCE.lock().unwrap().gen::<f64>()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub unit: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(unit: Duration, cap: Duration, jitter: f64) -> RetryPolicy {
        // Normalize jitter to the range [0, 1.0]
        let jitter = if jitter < NO_JITTER {
            NO_JITTER
        } else if jitter > MAX_JITTER {
            MAX_JITTER
        } else {
            jitter
        };
        RetryPolicy { unit, cap, jitter }
    }

    /// Computes the wait before the given attempt: `unit * 2^attempt`,
    /// capped, then reduced by a random fraction `[0, jitter)` of itself.
    pub fn backoff_wait(&self, attempt: u32) -> Duration {
        let attempt = attempt.min(MAX_ATTEMPT);
        let mut sleep = self
            .unit
            .checked_mul(1 << attempt)
            .unwrap_or(self.cap)
            .min(self.cap);
        if self.jitter != NO_JITTER {
            sleep = sleep.saturating_sub(sleep.mul_f64(random_float() * self.jitter));
        }
        sleep
    }
}

/// An infinite stream of attempt numbers, spaced by jittered exponential backoff.
///
/// The stream ends once the cancellation token it was created with fires.
/// Dropping it stops the backing timer task.
pub struct RetryTimer {
    rx: mpsc::Receiver<u32>,
    _guard: DropGuard,
}

impl Stream for RetryTimer {
    type Item = u32;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u32>> {
        self.rx.poll_recv(cx)
    }
}

// Creates a timer with exponentially increasing delays until the maximum
// retry attempts are reached. This function accepts the jitter factor.
pub fn new_retry_timer_with_jitter(
    unit: Duration,
    cap: Duration,
    jitter: f64,
    done: CancellationToken,
) -> RetryTimer {
    let policy = RetryPolicy::new(unit, cap, jitter);
    let token = done.child_token();
    let task_token = token.clone();
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut next_backoff = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => return,
                sent = tx.send(next_backoff) => {
                    if sent.is_err() {
                        return;
                    }
                    next_backoff = next_backoff.saturating_add(1);
                }
            }

            tokio::select! {
                biased;
                // Stop the timer in flight.
                _ = task_token.cancelled() => return,
                _ = tokio::time::sleep(policy.backoff_wait(next_backoff)) => {}
            }
        }
    });

    RetryTimer {
        rx,
        _guard: token.drop_guard(),
    }
}

// Creates a timer with exponentially increasing delays and full jitter.
pub fn new_retry_timer(unit: Duration, cap: Duration, done: CancellationToken) -> RetryTimer {
    new_retry_timer_with_jitter(unit, cap, MAX_JITTER, done)
}

// Creates a timer with the default unit and cap; effectively a random
// wait between 0 and 1 second per attempt.
pub fn new_retry_timer_simple(done: CancellationToken) -> RetryTimer {
    new_retry_timer_with_jitter(DEFAULT_RETRY_UNIT, DEFAULT_RETRY_CAP, MAX_JITTER, done)
}
