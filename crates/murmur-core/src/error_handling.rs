//! Terminal error kinds surfaced to the presenter.
//!
//! Transport failures are retried locally and only become visible when the
//! retry budget is exhausted. Stall timeouts never appear here: they are
//! converted to soft stream completion. Commit and auth failures always
//! surface; the partial answer already shown is not rolled back.

use murmur_gateway::GatewayError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or stream failure after the retry budget was spent.
    #[error("transport error: {0}")]
    Transport(String),
    /// The persistence append itself failed. Not retried.
    #[error("commit failed: {0}")]
    Commit(String),
    /// The gateway rejected the principal.
    #[error("authentication rejected: {0}")]
    Auth(String),
}

impl ErrorKind {
    /// Map a gateway failure from the commit path onto a terminal kind.
    pub fn from_gateway(err: GatewayError) -> Self {
        match err {
            GatewayError::Auth(message) => ErrorKind::Auth(message),
            other => ErrorKind::Commit(other.to_string()),
        }
    }
}
