//! Error taxonomy for the recovery runbook.

use thiserror::Error;

use crate::exec::CommandError;

/// Failures that abort a recovery session.
///
/// Soft conditions (no maintenance mode, low memory, an existing
/// reservation volume) never reach this type unless the operator declines
/// the confirmation, in which case they surface as [`OperatorDeclined`].
///
/// [`OperatorDeclined`]: RecoveryError::OperatorDeclined
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// One or more required tools are not on `PATH`.
    #[error("Required tools not found: {}", .0.join(", "))]
    ToolsMissing(Vec<String>),

    /// Not running inside the Portworx container.
    #[error("Unsupported execution context: PID 1 is '{found}', expected one of {expected}")]
    UnsupportedContext { found: String, expected: String },

    /// The named volume group does not exist.
    #[error("Volume group '{0}' not found")]
    GroupNotFound(String),

    /// The operator answered "no" to a confirmation gate.
    #[error("Aborted by operator: {0}")]
    OperatorDeclined(String),

    /// The original metadata copy could not be taken.
    #[error("Failed to copy original metadata: {0}")]
    MetadataCopy(String),

    /// `thin_repair` exited non-zero.
    #[error("thin_repair failed: {0}")]
    RepairFailed(String),

    /// The repaired metadata did not pass `thin_check`.
    #[error("Repaired metadata failed thin_check verification")]
    RepairedMetadataInvalid,

    /// Original and repaired blobs differ in size.
    #[error("Repaired metadata is {repaired} bytes but the original is {original} bytes")]
    SizeMismatch { original: u64, repaired: u64 },

    /// The live device table of the metadata volume is unusable.
    #[error("Cannot obtain device table for metadata volume: {0}")]
    SegmentTable(String),

    /// Writing the repaired metadata to the mapped device failed.
    #[error("Metadata write failed: {0}")]
    WriteFailed(String),

    /// Operator refused the transaction id fix; activation would fail.
    #[error(
        "Transaction id mismatch left unresolved (LVM expects {current}, repaired metadata has {repaired}); \
         the pool cannot be activated until they match"
    )]
    TransactionMismatchDeclined { current: u64, repaired: u64 },

    /// The pool did not come back healthy after activation.
    #[error("Thin pool is not healthy after activation: {0}")]
    PoolUnhealthy(String),

    /// An external command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}
