use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::utils::{rng_seed_now, sleep_until};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct State {
    is_write_lock: bool,
    refs: u32,
}

/// A local read/write lock whose acquisition gives up after a timeout.
pub struct TimedRWLock {
    ctx: CancellationToken,
    state: Mutex<State>,
}

impl Default for TimedRWLock {
    fn default() -> Self {
        TimedRWLock::new(CancellationToken::new())
    }
}

impl TimedRWLock {
    pub fn new(ctx: CancellationToken) -> TimedRWLock {
        TimedRWLock {
            ctx,
            state: Default::default(),
        }
    }

    pub async fn lock(&self, timeout: Duration) -> bool {
        self.lock_loop(timeout, true).await
    }

    pub async fn rlock(&self, timeout: Duration) -> bool {
        self.lock_loop(timeout, false).await
    }

    pub fn unlock(&self) {
        if !self.unlock_internal(true) {
            panic!("Trying to unlock() while no lock() is active");
        }
    }

    pub fn runlock(&self) {
        if !self.unlock_internal(false) {
            panic!("Trying to runlock() while no rlock() is active");
        }
    }

    async fn lock_loop(&self, timeout: Duration, is_write_lock: bool) -> bool {
        let rng = &mut rng_seed_now();
        let deadline = Instant::now() + timeout;
        loop {
            if self.lock_internal(is_write_lock) {
                return true;
            }
            if Instant::now() >= deadline {
                return false; // timeout
            }
            tokio::select! {
                _ = self.ctx.cancelled() => return false,
                _ = sleep_until(deadline, LOCK_RETRY_INTERVAL, Some(&mut *rng)) => {}
            }
        }
    }

    fn lock_internal(&self, is_write_lock: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if is_write_lock {
            if state.refs == 0 && !state.is_write_lock {
                state.refs = 1;
                state.is_write_lock = true;
                return true;
            }
        } else if !state.is_write_lock {
            state.refs += 1;
            return true;
        }
        false
    }

    fn unlock_internal(&self, is_write_lock: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if is_write_lock {
            if state.is_write_lock && state.refs == 1 {
                state.refs = 0;
                state.is_write_lock = false;
                return true;
            }
        } else if !state.is_write_lock && state.refs > 0 {
            state.refs -= 1;
            return true;
        }
        false
    }
}
