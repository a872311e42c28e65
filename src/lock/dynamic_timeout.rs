use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::time::Duration;

const DYNAMIC_TIMEOUT_INCREASE_THRESHOLD_PCT: f64 = 0.33; // Upper threshold for failures in order to increase timeout
const DYNAMIC_TIMEOUT_DECREASE_THRESHOLD_PCT: f64 = 0.10; // Lower threshold for failures in order to decrease timeout
const DYNAMIC_TIMEOUT_LOG_SIZE: usize = 16;
const MAX_DYNAMIC_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60); // Never set timeout bigger than this.

/// A timeout that adapts to how long lock acquisitions actually take.
pub struct DynamicTimeout {
    timeout: AtomicU64, // nanoseconds
    minimum: u64,       // nanoseconds
    // Outcome of the latest attempts; `None` marks a failure.
    log: Mutex<Vec<Option<Duration>>>,
}

impl DynamicTimeout {
    pub fn new(timeout: Duration, minimum: Duration) -> DynamicTimeout {
        if timeout == Duration::ZERO || minimum == Duration::ZERO {
            panic!("zero timeout");
        }
        let minimum = minimum.min(timeout);
        DynamicTimeout {
            timeout: AtomicU64::new(as_nanos(timeout)),
            minimum: as_nanos(minimum),
            log: Mutex::new(Vec::with_capacity(DYNAMIC_TIMEOUT_LOG_SIZE)),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout.load(Ordering::Relaxed))
    }

    pub fn log_success(&self, duration: Duration) {
        self.log_entry(Some(duration))
    }

    pub fn log_failure(&self) {
        self.log_entry(None)
    }

    fn log_entry(&self, entry: Option<Duration>) {
        let entries = {
            let mut log = self.log.lock().unwrap();
            log.push(entry);
            if log.len() < DYNAMIC_TIMEOUT_LOG_SIZE {
                return;
            }
            std::mem::replace(&mut *log, Vec::with_capacity(DYNAMIC_TIMEOUT_LOG_SIZE))
        };
        self.adjust(&entries);
    }

    fn adjust(&self, entries: &[Option<Duration>]) {
        let failures = entries.iter().filter(|e| e.is_none()).count();
        let max = entries.iter().flatten().max().copied().unwrap_or_default();

        let fail_percent = failures as f64 / entries.len() as f64;
        if fail_percent > DYNAMIC_TIMEOUT_INCREASE_THRESHOLD_PCT {
            // We are hitting the timeout too often, so increase the timeout by 25%
            let timeout = self.timeout.load(Ordering::Relaxed).saturating_mul(125) / 100;
            let timeout = timeout.min(as_nanos(MAX_DYNAMIC_TIMEOUT)).max(self.minimum);
            self.timeout.store(timeout, Ordering::Relaxed);
        } else if fail_percent < DYNAMIC_TIMEOUT_DECREASE_THRESHOLD_PCT {
            // We are hitting the timeout relatively few times,
            // so decrease the timeout towards 25 % of maximum time spent.
            let max = as_nanos(max).saturating_mul(125) / 100;
            let mut timeout = self.timeout.load(Ordering::Relaxed);
            if max < timeout {
                // Move 50% toward the max.
                timeout = (max + timeout) / 2;
            }
            self.timeout.store(timeout.max(self.minimum), Ordering::Relaxed);
        }
    }
}

fn as_nanos(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}
