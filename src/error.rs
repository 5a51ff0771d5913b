//! Typed errors for the boundaries that need more than `io::Result`.
//!
//! Syscall-adjacent loops (dispatcher, expire driver, registries) keep
//! returning `io::Result` the way the teacher's channel/session code does;
//! this enum exists for the fatal-init path and the module/config
//! boundaries, where a caller needs to match on *kind* rather than just log
//! and move on.

use std::fmt;

use thiserror::Error;

/// Errors that can abort daemon startup.
#[derive(Debug, Error)]
pub enum AutofsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Failures specific to loading and initializing the materialization module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module path {0:?} is not a regular file")]
    NotRegularFile(std::path::PathBuf),

    #[error("module path {0:?} is world-writable")]
    WorldWritable(std::path::PathBuf),

    #[error("module path {0:?} is not owned by uid 0")]
    NotOwnedByRoot(std::path::PathBuf),

    #[error("failed to load module library: {0}")]
    Load(#[from] libloading::Error),

    #[error("module is missing required symbol {0:?}")]
    MissingSymbol(&'static str),

    #[error("module init returned null")]
    InitFailed,

    #[error("module protocol version {got} does not match required {want}")]
    ProtocolMismatch { got: u32, want: u32 },

    #[error("module reported an empty name")]
    EmptyName,
}

/// Outcome of a call into the fallible module entry points (`do_work`),
/// distinct from `ModuleError` because it happens on the per-request path
/// and is handled by rollback rather than process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResult {
    Ok,
    Failed,
}

impl fmt::Display for WorkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkResult::Ok => write!(f, "ok"),
            WorkResult::Failed => write!(f, "failed"),
        }
    }
}
