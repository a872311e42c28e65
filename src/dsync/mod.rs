mod config;
mod drwmutex;
mod quorum;
mod retry;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
pub use config::*;
pub use drwmutex::*;
pub use quorum::{read_quorum, write_quorum};
pub use retry::*;
use serde::{Deserialize, Serialize};

// Dsync represents dsync client object which is initialized with
// authenticated clients, used to initiate lock RPC calls.
pub trait Dsync: Send + Sync {
    // List of RPC client objects, one per lock server.
    // The length of the returned list defines the quorum for one attempt.
    fn get_lockers(&self) -> Vec<Locker>;
}

impl<F> Dsync for F
where
    F: Fn() -> Vec<Locker> + Send + Sync,
{
    fn get_lockers(&self) -> Vec<Locker> {
        self()
    }
}

#[async_trait]
pub trait NetLocker: fmt::Display + Send + Sync {
    async fn rlock(&self, args: &LockArgs) -> anyhow::Result<bool>;
    async fn lock(&self, args: &LockArgs) -> anyhow::Result<bool>;
    async fn runlock(&self, args: &LockArgs) -> anyhow::Result<bool>;
    async fn unlock(&self, args: &LockArgs) -> anyhow::Result<bool>;
    // Has the lock identified by args expired on the remote side?
    async fn expired(&self, args: &LockArgs) -> anyhow::Result<bool>;
    // Closes any underlying connection to the service endpoint
    fn close(&self) -> anyhow::Result<()>;
    // Is the underlying connection online? (is always true for any local lockers)
    fn is_online(&self) -> bool;
}

/// One slot of a lockers snapshot.
#[derive(Clone)]
pub enum Locker {
    /// Known offline; always denies and never receives a release call.
    Offline,
    Online(Arc<dyn NetLocker>),
}

impl Locker {
    pub fn online<L: NetLocker + 'static>(locker: L) -> Locker {
        Locker::Online(Arc::new(locker))
    }

    pub fn is_online(&self) -> bool {
        match self {
            Locker::Offline => false,
            Locker::Online(locker) => locker.is_online(),
        }
    }
}

impl fmt::Display for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locker::Offline => write!(f, "<offline>"),
            Locker::Online(locker) => write!(f, "{}", locker),
        }
    }
}

impl From<Option<Arc<dyn NetLocker>>> for Locker {
    fn from(locker: Option<Arc<dyn NetLocker>>) -> Self {
        match locker {
            None => Locker::Offline,
            Some(locker) => Locker::Online(locker),
        }
    }
}

// LockArgs is minimal required values for any dsync compatible lock operation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct LockArgs {
    // Unique ID of lock/unlock request.
    #[serde(rename = "UID")]
    pub uid: String,
    // Resources contains single or multiple entries to be locked/unlocked.
    pub resources: Vec<String>,
    // Source contains the line number, function and file name of the code
    // on the client node that requested the lock.
    pub source: String,
}
