use std::collections::HashMap;
use std::panic::Location;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{error, trace};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::dsync::{self, DRWMutex, Dsync};
use crate::errors::LockError;
use crate::utils::path_join;

#[async_trait]
pub trait RWLocker: Send + Sync {
    async fn get_lock(&self, timeout: &DynamicTimeout) -> Result<(), LockError>;
    async fn unlock(&self);
    async fn get_rlock(&self, timeout: &DynamicTimeout) -> Result<(), LockError>;
    async fn runlock(&self);
}

struct NamespaceLock {
    refs: u32,
    lock: Arc<TimedRWLock>,
}

pub struct NamespaceLockMap {
    // Indicates if namespace is part of a distributed setup.
    is_dist_erasure: bool,
    config: dsync::Config,
    lock_map: Mutex<HashMap<String, NamespaceLock>>,
}

impl NamespaceLockMap {
    pub fn new(is_dist_erasure: bool) -> NamespaceLockMap {
        NamespaceLockMap::with_config(is_dist_erasure, dsync::Config::default())
    }

    pub fn with_config(is_dist_erasure: bool, config: dsync::Config) -> NamespaceLockMap {
        NamespaceLockMap {
            is_dist_erasure,
            config,
            lock_map: Default::default(),
        }
    }

    /// Returns a lock for the given paths of a volume.
    ///
    /// In a distributed setup the lock spans all lockers of `dsync`, otherwise
    /// it only guards against other users of this map.
    #[track_caller]
    pub fn new_ns_lock(
        self: &Arc<Self>,
        ctx: CancellationToken,
        dsync: Arc<dyn Dsync>,
        volume: &str,
        paths: &[&str],
    ) -> Box<dyn RWLocker> {
        let source = get_source(Location::caller());
        let ops_id = uuid::Uuid::new_v4().to_string();
        let mut paths: Vec<String> = paths.iter().map(|&p| p.to_owned()).collect();
        paths.sort();

        if self.is_dist_erasure {
            let names = paths.iter().map(|p| path_join(&[volume, p])).collect();
            Box::new(DistLockInstance {
                rw_mutex: DRWMutex::with_config(ctx.clone(), dsync, names, self.config.clone()),
                ctx,
                ops_id,
                source,
            })
        } else {
            Box::new(LocalLockInstance {
                ctx,
                ns: self.clone(),
                volume: volume.to_owned(),
                paths,
                ops_id,
                source,
            })
        }
    }

    async fn lock(
        &self,
        ctx: &CancellationToken,
        volume: &str,
        path: &str,
        lock_source: &str,
        ops_id: &str,
        read_lock: bool,
        timeout: Duration,
    ) -> bool {
        let resource = path_join(&[volume, path]);
        let lock = {
            let mut lock_map = self.lock_map.lock().unwrap();
            let ns_lock = lock_map
                .entry(resource.clone())
                .or_insert_with(|| NamespaceLock {
                    refs: 0,
                    // Bound to the context of the first user of this resource;
                    // cancelling it also stops every later waiter.
                    lock: Arc::new(TimedRWLock::new(ctx.clone())),
                });
            ns_lock.refs += 1;
            ns_lock.lock.clone()
            // Drop MutexGuard
        };

        trace!(
            "namespace lock {} for {}/{}, read lock: {}",
            resource,
            ops_id,
            lock_source,
            read_lock
        );
        let locked = if read_lock {
            lock.rlock(timeout).await
        } else {
            lock.lock(timeout).await
        };

        if !locked {
            // Decrement ref count since we failed to get the lock.
            self.release_ref(&resource);
        }
        locked
    }

    fn unlock(&self, volume: &str, path: &str, read_lock: bool) {
        let resource = path_join(&[volume, path]);
        let lock = match self.lock_map.lock().unwrap().get(&resource) {
            None => return,
            Some(ns_lock) => ns_lock.lock.clone(),
        };
        if read_lock {
            lock.runlock();
        } else {
            lock.unlock();
        }
        self.release_ref(&resource);
    }

    fn release_ref(&self, resource: &str) {
        let mut lock_map = self.lock_map.lock().unwrap();
        let ns_lock = match lock_map.get_mut(resource) {
            None => return,
            Some(ns_lock) => ns_lock,
        };
        if ns_lock.refs == 0 {
            error!("namespace reference count cannot be 0: {}", resource);
            return;
        }
        ns_lock.refs -= 1;
        if ns_lock.refs == 0 {
            // Remove from the map if there are no more references.
            lock_map.remove(resource);
        }
    }

    /// Number of resources that are locked or waited on.
    pub fn len(&self) -> usize {
        self.lock_map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Distributed lock instance from dsync.
struct DistLockInstance {
    rw_mutex: DRWMutex,
    ctx: CancellationToken,
    ops_id: String,
    source: String,
}

impl DistLockInstance {
    fn failure(&self) -> LockError {
        if self.ctx.is_cancelled() {
            LockError::OperationCanceled
        } else {
            LockError::OperationTimedOut
        }
    }
}

#[async_trait]
impl RWLocker for DistLockInstance {
    async fn get_lock(&self, timeout: &DynamicTimeout) -> Result<(), LockError> {
        let start = Instant::now();
        if !self
            .rw_mutex
            .get_lock(&self.ops_id, &self.source, timeout.timeout())
            .await
        {
            timeout.log_failure();
            return Err(self.failure());
        }
        timeout.log_success(start.elapsed());
        Ok(())
    }

    async fn unlock(&self) {
        self.rw_mutex.unlock().await
    }

    async fn get_rlock(&self, timeout: &DynamicTimeout) -> Result<(), LockError> {
        let start = Instant::now();
        if !self
            .rw_mutex
            .get_rlock(&self.ops_id, &self.source, timeout.timeout())
            .await
        {
            timeout.log_failure();
            return Err(self.failure());
        }
        timeout.log_success(start.elapsed());
        Ok(())
    }

    async fn runlock(&self) {
        self.rw_mutex.runlock().await
    }
}

// Local lock instance from the namespace lock map.
struct LocalLockInstance {
    ctx: CancellationToken,
    ns: Arc<NamespaceLockMap>,
    volume: String,
    paths: Vec<String>,
    ops_id: String,
    source: String,
}

impl LocalLockInstance {
    async fn lock_all(&self, timeout: &DynamicTimeout, read_lock: bool) -> Result<(), LockError> {
        let start = Instant::now();
        for (i, path) in self.paths.iter().enumerate() {
            let locked = self
                .ns
                .lock(
                    &self.ctx,
                    &self.volume,
                    path,
                    &self.source,
                    &self.ops_id,
                    read_lock,
                    timeout.timeout(),
                )
                .await;
            if !locked {
                timeout.log_failure();
                for path in &self.paths[..i] {
                    self.ns.unlock(&self.volume, path, read_lock);
                }
                return Err(if self.ctx.is_cancelled() {
                    LockError::OperationCanceled
                } else {
                    LockError::OperationTimedOut
                });
            }
        }
        timeout.log_success(start.elapsed());
        Ok(())
    }

    fn unlock_all(&self, read_lock: bool) {
        for path in &self.paths {
            self.ns.unlock(&self.volume, path, read_lock);
        }
    }
}

#[async_trait]
impl RWLocker for LocalLockInstance {
    async fn get_lock(&self, timeout: &DynamicTimeout) -> Result<(), LockError> {
        self.lock_all(timeout, false).await
    }

    async fn unlock(&self) {
        self.unlock_all(false)
    }

    async fn get_rlock(&self, timeout: &DynamicTimeout) -> Result<(), LockError> {
        self.lock_all(timeout, true).await
    }

    async fn runlock(&self) {
        self.unlock_all(true)
    }
}

// Formats the caller location as the lock source, e.g. `[object.rs:42]`.
fn get_source(location: &Location<'_>) -> String {
    let file = Path::new(location.file())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("<unknown>");
    format!("[{}:{}]", file, location.line())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsync::mock::*;
    use crate::utils::assert::*;

    fn new_timeout() -> DynamicTimeout {
        DynamicTimeout::new(Duration::from_secs(2), Duration::from_millis(500))
    }

    fn no_dsync() -> Arc<dyn Dsync> {
        Arc::new(Vec::<dsync::Locker>::new)
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_lock_excludes() {
        let ns = Arc::new(NamespaceLockMap::new(false));
        let ctx = CancellationToken::new();
        let timeout = new_timeout();

        let first = ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["object"]);
        let second = ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["object"]);

        assert_ok!(first.get_lock(&timeout).await);
        assert_eq!(
            second.get_lock(&timeout).await,
            Err(LockError::OperationTimedOut)
        );
        assert_eq!(
            second.get_rlock(&timeout).await,
            Err(LockError::OperationTimedOut)
        );
        assert_eq!(ns.len(), 1);

        first.unlock().await;
        assert!(ns.is_empty());
        assert_ok!(second.get_lock(&timeout).await);
        second.unlock().await;
        assert!(ns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_readers_share() {
        let ns = Arc::new(NamespaceLockMap::new(false));
        let ctx = CancellationToken::new();
        let timeout = new_timeout();

        let readers: Vec<_> = (0..3)
            .map(|_| ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["a", "b"]))
            .collect();
        for reader in &readers {
            assert_ok!(reader.get_rlock(&timeout).await);
        }
        assert_eq!(ns.len(), 2);

        let writer = ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["b"]);
        assert_err!(writer.get_lock(&timeout).await);

        for reader in &readers {
            reader.runlock().await;
        }
        assert!(ns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_lock_rolls_back_partial() {
        let ns = Arc::new(NamespaceLockMap::new(false));
        let ctx = CancellationToken::new();
        let timeout = new_timeout();

        let holder = ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["b"]);
        assert_ok!(holder.get_lock(&timeout).await);

        // Paths are sorted, so "a" is taken before "b" times out.
        let multi = ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["b", "a"]);
        assert_err!(multi.get_lock(&timeout).await);
        assert_eq!(ns.len(), 1);

        holder.unlock().await;
        assert_ok!(multi.get_lock(&timeout).await);
        assert_eq!(ns.len(), 2);
        multi.unlock().await;
        assert!(ns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_lock_cancelled() {
        let ns = Arc::new(NamespaceLockMap::new(false));
        let ctx = CancellationToken::new();
        let timeout = new_timeout();

        let holder = ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["object"]);
        assert_ok!(holder.get_lock(&timeout).await);

        ctx.cancel();
        let waiter = ns.new_ns_lock(ctx.clone(), no_dsync(), "bucket", &["object"]);
        assert_eq!(
            waiter.get_lock(&timeout).await,
            Err(LockError::OperationCanceled)
        );
        holder.unlock().await;
        assert!(ns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_lock_follows_first_context() {
        let ns = Arc::new(NamespaceLockMap::new(false));
        let first_ctx = CancellationToken::new();
        let timeout = new_timeout();

        let holder = ns.new_ns_lock(first_ctx.clone(), no_dsync(), "bucket", &["object"]);
        assert_ok!(holder.get_lock(&timeout).await);

        first_ctx.cancel();
        let waiter = ns.new_ns_lock(CancellationToken::new(), no_dsync(), "bucket", &["object"]);
        let start = Instant::now();
        assert_eq!(
            waiter.get_lock(&timeout).await,
            Err(LockError::OperationTimedOut)
        );
        // Stopped by the holder's context long before its own timeout.
        assert!(start.elapsed() < timeout.timeout());

        holder.unlock().await;
        assert!(ns.is_empty());
    }

    #[tokio::test]
    async fn test_unlock_unknown_resource() {
        let ns = Arc::new(NamespaceLockMap::new(false));
        let lk = ns.new_ns_lock(CancellationToken::new(), no_dsync(), "bucket", &["object"]);
        // Nothing was locked, so there is nothing to release.
        lk.unlock().await;
        assert!(ns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dist_lock() {
        let lockers = new_lockers(4);
        let dsync = new_dsync(&lockers);
        let ns = Arc::new(NamespaceLockMap::new(true));
        let ctx = CancellationToken::new();
        let timeout = new_timeout();

        let first = ns.new_ns_lock(ctx.clone(), dsync.clone(), "bucket", &["b", "a"]);
        let second = ns.new_ns_lock(ctx.clone(), dsync.clone(), "bucket", &["a"]);

        assert_ok!(first.get_lock(&timeout).await);
        // Both resources are locked on every node.
        assert!(lockers.iter().all(|l| l.held() == 2));
        // Distributed locks never touch the local map.
        assert!(ns.is_empty());

        assert_eq!(
            second.get_rlock(&timeout).await,
            Err(LockError::OperationTimedOut)
        );

        first.unlock().await;
        assert!(lockers.iter().all(|l| l.held() == 0));
        assert_ok!(second.get_rlock(&timeout).await);
        second.runlock().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(lockers.iter().all(|l| l.held() == 0));
    }

    #[tokio::test]
    async fn test_dist_lock_cancelled() {
        let lockers = new_lockers(4);
        let dsync = new_dsync(&lockers);
        let ns = Arc::new(NamespaceLockMap::new(true));
        let ctx = CancellationToken::new();
        ctx.cancel();

        let lk = ns.new_ns_lock(ctx, dsync, "bucket", &["object"]);
        assert_eq!(
            lk.get_lock(&new_timeout()).await,
            Err(LockError::OperationCanceled)
        );
        assert!(lockers.iter().all(|l| l.grants() == 0));
    }

    #[test]
    fn test_get_source() {
        let source = get_source(Location::caller());
        assert!(source.starts_with("[namespace_lock.rs:"), "{}", source);
        assert!(source.ends_with(']'));
    }
}
