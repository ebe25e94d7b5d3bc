//! Error types shared across the runtime.

use thiserror::Error;

/// Terminal outcome of a fiber that did not produce a value.
///
/// Stored in failed promises. Between fibers, failures travel only as
/// events or failed promises, never as unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FiberError {
    /// The fiber body panicked before completing.
    #[error("fiber crashed before completing")]
    Crashed,
    /// The fiber was spawned after system shutdown and never ran.
    #[error("system is shutting down")]
    ShuttingDown,
}

/// Error returned by [`FiberRef::try_send`](crate::FiberRef::try_send).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The target uses a bounded mailbox and it is at capacity.
    #[error("mailbox is full")]
    Full,
}
