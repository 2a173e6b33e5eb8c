//! Error taxonomy for the sandbox core.
//!
//! Validation failures (`PathViolation`, `NotFound`, the `*NotFound`
//! variants) surface immediately to the caller as typed errors. Spawn
//! failures are folded into the structured execution result by the shell
//! executor, and termination failures leave registry state intact so the
//! caller can retry. Every failure path yields an explicit status.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The requested path resolves outside the sandbox root. Never
    /// auto-corrected.
    #[error("access denied: path escapes the sandbox root: {path}")]
    PathViolation { path: String },

    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("invalid glob pattern: {reason}")]
    InvalidPattern { reason: String },

    #[error("process not found: {id}")]
    ProcessNotFound { id: String },

    /// The process's stdin pipe is closed, typically because it already
    /// exited.
    #[error("process {id} is not accepting input")]
    ProcessNotAcceptingInput { id: String },

    #[error("service not found: {name}")]
    ServiceNotFound { name: String },

    #[error("command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// A kill or stop request could not confirm that the target exited.
    /// The handle stays registered so the operation can be retried.
    #[error("failed to confirm termination of {id}: {reason}")]
    TerminationFailure { id: String, reason: String },

    /// A supervisor operation against the backing runtime failed.
    #[error("service {name} operation failed: {reason}")]
    ServiceFailure { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
