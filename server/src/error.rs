use shared::{Phase, WireError};
use std::io;
use thiserror::Error;

/// Failures while loading a map or ruleset.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("'{0}' not found")]
    NotFound(String),
    /// Allocation failed; clearing the asset cache may help.
    #[error("out of memory while loading '{0}'")]
    OutOfMemory(String),
    #[error("'{0}' is invalid: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not open UDP socket: {0}")]
    Bind(#[source] io::Error),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("could not load game assets: {0}")]
    Load(#[from] LoadError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("server has no open socket")]
    NotRunning,

    #[error("operation not allowed in phase {0:?}")]
    InvalidPhase(Phase),

    #[error("configuration error: {0}")]
    Config(String),
}
