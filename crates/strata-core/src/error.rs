//! Error types surfaced at the engine's public seams.
//!
//! Internal plumbing uses `anyhow` with context; these types exist where
//! callers need to branch on the kind of failure (primarily submission).

use thiserror::Error;

/// Parameter validation failure raised by a job class.
///
/// Submission rejects the request before any job row is created.
#[derive(Debug, Clone, Error)]
#[error("invalid parameters: {0}")]
pub struct InvalidParameters(pub String);

/// Failure of the submission surface.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The job type is not present in the registry.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The job class rejected the parameters.
    #[error(transparent)]
    InvalidParameters(#[from] InvalidParameters),

    /// Store or broker failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
