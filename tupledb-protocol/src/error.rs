//! Protocol error types.

use thiserror::Error;

/// Errors produced while framing or (de)serializing wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid length marker: {0:#04x}")]
    InvalidMarker(u8),

    #[error("zero-length frame")]
    ZeroLength,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("greeting must be {expected} bytes, got {actual}")]
    ShortGreeting { expected: usize, actual: usize },

    #[error("malformed salt: {0}")]
    Salt(#[from] base64::DecodeError),

    #[error("salt too short: {0} bytes")]
    SaltTooShort(usize),

    #[error("decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("frame header is not a map")]
    HeaderShape,

    #[error("response body is not a map")]
    BodyShape,

    #[error("response data is not an array")]
    DataShape,

    #[error("response carries no data")]
    MissingData,

    #[error("typed decode error: {0}")]
    Typed(String),
}

/// Application-level error returned by the server in a well-formed response.
///
/// The socket stays usable; only the request that triggered it fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code:#x})")]
pub struct ServerError {
    pub code: u32,
    pub message: String,
}
