// src/errors.rs

//! Crate-wide error type and helpers.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MartianError {
    #[error("a pipestance named '{0}' already exists in this directory")]
    PipestanceExists(String),

    #[error("pipestance '{psid}' was invoked with a different invocation than {path}")]
    PipestanceInvocation { psid: String, path: PathBuf },

    #[error("'{0}' is not a pipestance directory")]
    PipestancePath(PathBuf),

    #[error("pipestance is locked by another process: {0}")]
    PipestanceLocked(PathBuf),

    #[error("pipestance was started with jobmode '{expected}' but reattach requested '{actual}'")]
    JobModeMismatch { expected: String, actual: String },

    #[error("invalid VDR mode: {0} (expected \"rolling\", \"post\" or \"disable\")")]
    InvalidVdrMode(String),

    #[error("invalid profile mode: {0}")]
    InvalidProfileMode(String),

    #[error("'{0}' is not a declared pipeline or stage")]
    UnknownCallable(String),

    #[error("cycle detected in call graph: {0}")]
    GraphCycle(String),

    #[error("invalid invocation: {0}")]
    Invocation(String),

    #[error("metadata file {0} is too large to read")]
    MetadataTooLarge(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MartianError {
    /// Process exit code for this error: 1 for user errors, 2 for runtime
    /// fatals. Preflight failures (exit code 3) are reported through the
    /// pipestance final state rather than an error value.
    pub fn exit_code(&self) -> i32 {
        match self {
            MartianError::PipestanceExists(_)
            | MartianError::PipestanceInvocation { .. }
            | MartianError::PipestancePath(_)
            | MartianError::PipestanceLocked(_)
            | MartianError::JobModeMismatch { .. }
            | MartianError::InvalidVdrMode(_)
            | MartianError::InvalidProfileMode(_)
            | MartianError::UnknownCallable(_)
            | MartianError::Invocation(_) => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, MartianError>;
