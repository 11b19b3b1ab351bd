//! Error abstractions.

/// The error type used to indicate that a pipeline instance must shut down.
///
/// Transient store and ledger failures are absorbed at the controller boundary
/// and retried on the next natural cycle; this type is reserved for conditions
/// which indicate a broken contract, such as a completion report referencing
/// an unknown batch.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
