//! Client error types.

use thiserror::Error;
use tupledb_protocol::{ProtocolError, ServerError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("connection is not ready")]
    NotConnected,

    #[error("connection closed by client")]
    ConnectionClosed,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("request {0} timed out")]
    RequestTimeout(u32),

    #[error("there is no space with name {0}")]
    UnknownSpace(String),

    #[error("there is no space with id {0}")]
    UnknownSpaceId(u32),

    #[error("space {space} has no index with name {index}")]
    UnknownIndex { space: String, index: String },

    #[error("unexpected catalog row: {0}")]
    Catalog(String),
}

impl ClientError {
    /// Whether retrying the operation on the same connection can succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(self, ClientError::NotConnected)
    }
}
