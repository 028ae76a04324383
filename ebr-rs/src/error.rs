use thiserror::Error;

/// Errors reported by the collector.
///
/// All of them are local to the calling thread's operation: the collector has no global error
/// state, and a failed operation leaves it exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EbrError {
    /// An internal node could not be allocated.
    ///
    /// Returned by `enter_critical_region` when the calling thread's record cannot be created (the
    /// thread did not enter), and by `queue_for_deletion` when the pending entry cannot be created
    /// (the object is not queued and remains the caller's responsibility).
    #[error("failed to allocate {what}")]
    OutOfMemory { what: &'static str },

    /// `queue_for_deletion` was called while the calling thread was not inside a critical region
    /// of the collector. The object is neither queued nor deleted.
    #[error("objects must be queued for deletion from within a critical region")]
    NotInCriticalRegion,

    /// `queue_for_deletion` was called with a null object.
    #[error("cannot queue a null object for deletion")]
    NullObject,

    /// `exit_critical_region` without a matching `enter_critical_region`.
    #[error("exiting a critical region that was never entered")]
    UnbalancedExit,

    /// The calling thread's thread-local state has already been destroyed.
    #[error("thread-local collector state is unavailable during thread teardown")]
    ThreadExiting,
}
