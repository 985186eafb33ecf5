//! Error taxonomy for the session engine.

use thiserror::Error;

/// Errors surfaced by the engine itself, as opposed to protocol-level
/// failures carried inside a [`crate::message::Message`] reply.
#[derive(Debug, Error)]
pub enum BayeuxError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no transport negotiated: client offered {client:?}, server supports {server:?}")]
    NoTransport {
        client: Vec<String>,
        server: Vec<String>,
    },

    #[error("transport send failed: {0}")]
    Transport(String),

    #[error("remote call timed out")]
    Timeout,

    #[error("illegal use: {0}")]
    IllegalUse(&'static str),

    #[error("endBatch called without a matching startBatch")]
    UnbalancedBatch,
}

pub type Result<T> = std::result::Result<T, BayeuxError>;
