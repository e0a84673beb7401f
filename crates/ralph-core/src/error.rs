//! Core error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the loop runner and its collaborators.
///
/// The taxonomy mirrors the exit-code contract: [`RalphError::Config`]
/// variants are operator mistakes (exit 2), the rest are runtime failures
/// (exit 1).
#[derive(Debug, Error)]
pub enum RalphError {
    /// Configuration errors: missing PRD, unreadable file, invalid JSON,
    /// unknown backend. Never recorded in the registry as `failed`.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("PRD not found at {0}")]
    PrdNotFound(PathBuf),

    #[error("invalid PRD {path}: {reason}")]
    PrdInvalid { path: PathBuf, reason: String },

    #[error("git error: {0}")]
    Git(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("session '{0}' already running (pid {1})")]
    SessionConflict(String, i32),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error(transparent)]
    Adapter(#[from] ralph_adapters::AdapterError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RalphResult<T> = Result<T, RalphError>;

impl RalphError {
    /// Exit code this error maps to at the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            RalphError::Config(_)
            | RalphError::PrdNotFound(_)
            | RalphError::PrdInvalid { .. } => 2,
            _ => 1,
        }
    }
}
