mod dynamic_timeout;
mod namespace_lock;
mod timed_rwlock;

pub use dynamic_timeout::*;
pub use namespace_lock::*;
pub use timed_rwlock::*;
