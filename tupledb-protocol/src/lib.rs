//! # tupledb-protocol
//!
//! Wire protocol implementation for tupledb - framing, request packing,
//! response decoding.
//!
//! This crate provides:
//! - Length-prefixed binary framing
//! - msgpack request/response codecs with integer-keyed field maps
//! - Greeting parsing and the chap-sha1 credential scramble

pub mod auth;
pub mod error;
pub mod frame;
pub mod request;
pub mod response;

pub use auth::{scramble, Greeting, GREETING_SIZE, SCRAMBLE_SIZE};
pub use error::{ProtocolError, ServerError};
pub use frame::{LENGTH_MARKER, PACKET_LENGTH_BYTES};
pub use request::{field, IteratorKind, Request, RequestCode};
pub use response::Response;

/// Result code of a successful response.
pub const OK_CODE: u32 = 0;

/// Maximum accepted frame body size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
