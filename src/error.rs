//! Crate-wide error taxonomy.
//!
//! Each variant maps to one of the kinds in the design's error taxonomy:
//! decode, storage, remote-auth, remote-transient, remote-expired,
//! lock-busy, context-cancelled, invalid-input.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("remote authentication failed: {0}")]
    RemoteAuth(String),

    #[error("remote error (retryable): {0}")]
    RemoteTransient(String),

    #[error("pre-signed url expired")]
    RemoteExpired,

    #[error("file lock busy: {0}")]
    LockBusy(String),

    #[error("operation cancelled")]
    ContextCancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
