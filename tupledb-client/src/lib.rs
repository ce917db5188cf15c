//! # tupledb-client
//!
//! Async client library for tupledb.
//!
//! This crate provides:
//! - One persistent connection multiplexing many concurrent requests
//! - Bounded reconnect-on-failure with backoff
//! - Schema-aware name resolution for spaces and indexes
//! - Plain, typed, and async variants of every operation

pub mod client;
pub mod connection;
pub mod error;
pub mod future;
pub mod schema;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use future::ResponseFuture;
pub use schema::{Field, Index, IndexPart, IndexRef, Schema, Space, SpaceRef};

pub use tupledb_protocol::{Greeting, IteratorKind, Response, ServerError};
