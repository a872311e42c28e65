use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LockError {
    // A timeout occurred while acquiring a lock.
    #[error("Operation timed out")]
    OperationTimedOut,

    // The context of the lock got cancelled before it was acquired.
    #[error("Operation canceled")]
    OperationCanceled,
}
