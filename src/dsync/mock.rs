use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Duration;

use super::*;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Behavior {
    // Grant according to the lock table.
    Normal,
    // Answer every lock request with a denial.
    Deny,
    // Fail every lock request with an error.
    Fail,
}

#[derive(Default)]
struct Entry {
    writer: Option<String>,
    readers: Vec<String>,
}

/// In-memory lock server used to simulate one node.
pub(crate) struct MockLocker {
    name: String,
    behavior: Mutex<Behavior>,
    delay: Mutex<Duration>,
    release_delay: Mutex<Duration>,
    table: Mutex<HashMap<String, Entry>>,
    released: Mutex<Vec<String>>,
    pub(crate) grants: AtomicUsize,
    pub(crate) unlock_calls: AtomicUsize,
    pub(crate) runlock_calls: AtomicUsize,
}

impl MockLocker {
    pub(crate) fn new(name: &str) -> MockLocker {
        MockLocker {
            name: name.to_owned(),
            behavior: Mutex::new(Behavior::Normal),
            delay: Mutex::new(Duration::ZERO),
            release_delay: Mutex::new(Duration::ZERO),
            table: Default::default(),
            released: Default::default(),
            grants: Default::default(),
            unlock_calls: Default::default(),
            runlock_calls: Default::default(),
        }
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    // Delays the answer to every lock request.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    // Delays the answer to every release request.
    pub(crate) fn set_release_delay(&self, delay: Duration) {
        *self.release_delay.lock().unwrap() = delay;
    }

    pub(crate) fn grants(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst) + self.runlock_calls.load(Ordering::SeqCst)
    }

    // UIDs of the grants released, in release order.
    pub(crate) fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    // Number of locks currently held, shared ones counted individually.
    pub(crate) fn held(&self) -> usize {
        self.table
            .lock()
            .unwrap()
            .values()
            .map(|e| e.readers.len() + e.writer.iter().count())
            .sum()
    }

    async fn acquire(&self, args: &LockArgs, is_read_lock: bool) -> anyhow::Result<bool> {
        let delay = *self.delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        match *self.behavior.lock().unwrap() {
            Behavior::Normal => {}
            Behavior::Deny => return Ok(false),
            Behavior::Fail => anyhow::bail!("{}: connection refused", self.name),
        }

        let mut table = self.table.lock().unwrap();
        let free = args.resources.iter().all(|resource| match table.get(resource) {
            None => true,
            Some(entry) => entry.writer.is_none() && (is_read_lock || entry.readers.is_empty()),
        });
        if !free {
            return Ok(false);
        }
        for resource in &args.resources {
            let entry = table.entry(resource.clone()).or_default();
            if is_read_lock {
                entry.readers.push(args.uid.clone());
            } else {
                entry.writer = Some(args.uid.clone());
            }
        }
        self.grants.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn release_wait(&self) {
        let delay = *self.release_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }

    fn release(&self, args: &LockArgs, is_read_lock: bool) -> bool {
        let mut table = self.table.lock().unwrap();
        let mut found = false;
        for resource in &args.resources {
            let entry = match table.get_mut(resource) {
                Some(entry) => entry,
                None => continue,
            };
            if is_read_lock {
                if let Some(pos) = entry.readers.iter().position(|uid| *uid == args.uid) {
                    entry.readers.remove(pos);
                    found = true;
                }
            } else if entry.writer.as_deref() == Some(args.uid.as_str()) {
                entry.writer = None;
                found = true;
            }
            if entry.writer.is_none() && entry.readers.is_empty() {
                table.remove(resource);
            }
        }
        if found {
            self.released.lock().unwrap().push(args.uid.clone());
        }
        found
    }
}

impl fmt::Display for MockLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait]
impl NetLocker for MockLocker {
    async fn rlock(&self, args: &LockArgs) -> anyhow::Result<bool> {
        self.acquire(args, true).await
    }

    async fn lock(&self, args: &LockArgs) -> anyhow::Result<bool> {
        self.acquire(args, false).await
    }

    async fn runlock(&self, args: &LockArgs) -> anyhow::Result<bool> {
        self.runlock_calls.fetch_add(1, Ordering::SeqCst);
        self.release_wait().await;
        Ok(self.release(args, true))
    }

    async fn unlock(&self, args: &LockArgs) -> anyhow::Result<bool> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        self.release_wait().await;
        Ok(self.release(args, false))
    }

    async fn expired(&self, args: &LockArgs) -> anyhow::Result<bool> {
        let table = self.table.lock().unwrap();
        Ok(args.resources.iter().all(|resource| match table.get(resource) {
            None => true,
            Some(entry) => {
                entry.writer.as_deref() != Some(args.uid.as_str())
                    && !entry.readers.contains(&args.uid)
            }
        }))
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_online(&self) -> bool {
        *self.behavior.lock().unwrap() != Behavior::Fail
    }
}

pub(crate) fn new_lockers(n: usize) -> Vec<Arc<MockLocker>> {
    (0..n)
        .map(|i| Arc::new(MockLocker::new(&format!("node-{}", i))))
        .collect()
}

// A Dsync handing out the given lockers on every call.
pub(crate) fn new_dsync(lockers: &[Arc<MockLocker>]) -> Arc<dyn Dsync> {
    let lockers = lockers.to_vec();
    Arc::new(move || {
        lockers
            .iter()
            .map(|locker| Locker::Online(locker.clone()))
            .collect::<Vec<_>>()
    })
}
