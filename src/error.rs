use thiserror::Error as DeriveError;

/// Why a non-blocking lock attempt against a [`TryLock`] backend failed.
///
/// [`TryLock`]: crate::lock::TryLock
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeriveError)]
pub enum TryLockError {
    /// Another holder owns the lock and it is not old enough to steal.
    #[error("lock is held by another owner")]
    Held,
    /// The backend has no room to record another held lock.
    #[error("no free slot in bucket {bucket}")]
    Overloaded { bucket: usize },
}

/// Rejected slot table geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeriveError)]
pub enum ConfigError {
    #[error("slot table needs at least one bucket")]
    ZeroBuckets,
    #[error("slot table buckets need at least one slot")]
    ZeroSlots,
    #[error("{buckets} buckets cannot be addressed by a single digest byte")]
    TooManyBuckets { buckets: usize },
}
