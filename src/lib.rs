//! Distributed, quorum-based read/write locking.
//!
//! [`dsync::DRWMutex`] acquires a lock on a majority of independent lock
//! nodes; [`lock::NamespaceLockMap`] builds namespace locks for volumes and
//! paths on top of it, or on local timed locks when the setup is not
//! distributed.

pub mod dsync;
pub mod errors;
pub mod lock;
pub mod logger;
pub mod utils;
