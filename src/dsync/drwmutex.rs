use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use log::trace;
use tokio::time::{timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::quorum::{self, is_locked};
use super::*;

#[derive(Default)]
struct LockState {
    write_locks: Vec<String>,             // Array of nodes that granted a write lock
    readers_locks: VecDeque<Vec<String>>, // Array of array of nodes that granted reader locks
}

/// A distributed read/write mutual exclusion lock.
///
/// A lock is held once a quorum of the lockers returned by the [`Dsync`]
/// collaborator granted it. The handle can be shared between tasks; the
/// grants it holds are tracked per locker so they can be released again.
///
/// Shared locks are released in the order they were acquired, independent
/// of which task calls [`DRWMutex::runlock`].
pub struct DRWMutex<D: Dsync + ?Sized = dyn Dsync> {
    pub names: Vec<String>,
    dsync: Arc<D>,
    config: Config,
    ctx: CancellationToken,
    state: Mutex<LockState>,
}

impl<D: Dsync + ?Sized> DRWMutex<D> {
    pub fn new(ctx: CancellationToken, dsync: Arc<D>, names: Vec<String>) -> DRWMutex<D> {
        DRWMutex::with_config(ctx, dsync, names, Config::default())
    }

    pub fn with_config(
        ctx: CancellationToken,
        dsync: Arc<D>,
        names: Vec<String>,
        config: Config,
    ) -> DRWMutex<D> {
        let n = dsync.get_lockers().len();
        DRWMutex {
            names,
            dsync,
            config,
            ctx,
            state: Mutex::new(LockState {
                write_locks: vec![String::new(); n],
                readers_locks: VecDeque::new(),
            }),
        }
    }

    /// Holds a write lock, blocking until it is acquired.
    ///
    /// Returns `false` only when the context got cancelled first.
    pub async fn lock(&self, id: &str, source: &str) -> bool {
        self.lock_blocking(id, source, false, None).await
    }

    /// Tries to get a write lock within the timeout.
    pub async fn get_lock(&self, id: &str, source: &str, timeout: Duration) -> bool {
        self.lock_blocking(id, source, false, Some(timeout)).await
    }

    /// Holds a read lock, blocking until it is acquired.
    ///
    /// Returns `false` only when the context got cancelled first.
    pub async fn rlock(&self, id: &str, source: &str) -> bool {
        self.lock_blocking(id, source, true, None).await
    }

    /// Tries to get a read lock within the timeout.
    pub async fn get_rlock(&self, id: &str, source: &str, timeout: Duration) -> bool {
        self.lock_blocking(id, source, true, Some(timeout)).await
    }

    // Tries to acquire the lock until success, cancellation or the timeout.
    async fn lock_blocking(
        &self,
        id: &str,
        source: &str,
        is_read_lock: bool,
        timeout: Option<Duration>,
    ) -> bool {
        trace!(
            "lock_blocking {}/{} for {:?}: lock type {}, timeout {:?}",
            id,
            source,
            self.names,
            if is_read_lock { "Read" } else { "Write" },
            timeout
        );

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut retry = new_retry_timer_with_jitter(
            self.config.retry_unit,
            self.config.retry_cap,
            self.config.retry_jitter,
            self.ctx.clone(),
        );

        // The first attempt is always made, even with a zero timeout.
        let mut attempt = retry.next().await;
        while attempt.is_some() {
            if self.ctx.is_cancelled() {
                return false;
            }

            let lockers = self.dsync.get_lockers();
            let locked = quorum::lock(
                &lockers,
                id,
                source,
                is_read_lock,
                &self.names,
                &self.config,
            )
            .await;
            if let Some(locks) = locked {
                let mut state = self.state.lock().unwrap();
                if is_read_lock {
                    state.readers_locks.push_back(locks);
                } else {
                    state.write_locks = locks;
                }
                return true;
            }

            attempt = match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    timeout_at(deadline, retry.next()).await.unwrap_or(None)
                }
                None => retry.next().await,
            };
        }
        false
    }

    /// Releases the write lock.
    ///
    /// # Panics
    ///
    /// Panics if no write lock is held.
    pub async fn unlock(&self) {
        let locks = {
            let mut state = self.state.lock().unwrap();
            if !state.write_locks.iter().any(|uid| is_locked(uid)) {
                drop(state);
                panic!("Trying to unlock() while no lock() is active");
            }
            let n = state.write_locks.len();
            std::mem::replace(&mut state.write_locks, vec![String::new(); n])
        };

        let lockers = self.dsync.get_lockers();
        quorum::spawn_unlock(
            lockers,
            locks,
            false,
            self.names.clone(),
            self.config.clone(),
        )
        .await;
    }

    /// Releases the oldest read lock held by this handle.
    ///
    /// # Panics
    ///
    /// Panics if no read lock is held.
    pub async fn runlock(&self) {
        let locks = {
            let mut state = self.state.lock().unwrap();
            match state.readers_locks.pop_front() {
                Some(locks) => locks,
                None => {
                    drop(state);
                    panic!("Trying to runlock() while no rlock() is active");
                }
            }
        };

        let lockers = self.dsync.get_lockers();
        quorum::spawn_unlock(
            lockers,
            locks,
            true,
            self.names.clone(),
            self.config.clone(),
        )
        .await;
    }

    pub fn is_write_locked(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.write_locks.iter().any(|uid| is_locked(uid))
    }

    /// Number of read locks currently held through this handle.
    pub fn readers(&self) -> usize {
        self.state.lock().unwrap().readers_locks.len()
    }
}
