//! Future/correlation layer: handles for in-flight requests.

use crate::connection::Connection;
use crate::error::ClientError;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::oneshot;
use tupledb_protocol::{ProtocolError, Response};

/// Handle for one outstanding request.
///
/// Resolution is single-writer: exactly one of the reader loop, connection
/// teardown, or the client-side timeout completes it. The reader and the
/// timeout both go through the registration map, so the loser of that race
/// is a no-op.
pub struct ResponseFuture {
    state: FutureState,
}

enum FutureState {
    /// Registered and on the wire; waiting on the reader loop.
    Pending {
        conn: Arc<Connection>,
        sync: u32,
        rx: oneshot::Receiver<Result<Response, ClientError>>,
    },
    /// Failed before reaching the wire (resolution or enqueue error).
    Failed(ClientError),
}

impl ResponseFuture {
    pub(crate) fn pending(
        conn: Arc<Connection>,
        sync: u32,
        rx: oneshot::Receiver<Result<Response, ClientError>>,
    ) -> Self {
        Self {
            state: FutureState::Pending { conn, sync, rx },
        }
    }

    pub(crate) fn failed(err: ClientError) -> Self {
        Self {
            state: FutureState::Failed(err),
        }
    }

    /// Correlation id, when the request made it onto the wire.
    pub fn sync(&self) -> Option<u32> {
        match &self.state {
            FutureState::Pending { sync, .. } => Some(*sync),
            FutureState::Failed(_) => None,
        }
    }

    /// Blocks until the response arrives, the connection dies, or the
    /// configured request timeout elapses.
    async fn wait(self) -> Result<Response, ClientError> {
        let (conn, sync, rx) = match self.state {
            FutureState::Pending { conn, sync, rx } => (conn, sync, rx),
            FutureState::Failed(err) => return Err(err),
        };
        match conn.config().request_timeout {
            None => rx.await.unwrap_or(Err(ClientError::ConnectionClosed)),
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(resolved) => resolved.unwrap_or(Err(ClientError::ConnectionClosed)),
                Err(_) => {
                    // Deregister so a late response is dropped by the
                    // reader instead of resolving a dead handle.
                    conn.forget(sync).await;
                    Err(ClientError::RequestTimeout(sync))
                }
            },
        }
    }

    /// Waits for and decodes the response; a non-success result code
    /// surfaces as a server error.
    pub async fn get(self) -> Result<Response, ClientError> {
        let mut response = self.wait().await?;
        response.decode_body()?;
        response.check()?;
        Ok(response)
    }

    /// Waits for the response and decodes its data rows directly into `T`.
    pub async fn get_typed<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        let mut response = self.wait().await?;
        let typed = response.decode_body_typed::<T>()?;
        response.check()?;
        typed.ok_or(ClientError::Protocol(ProtocolError::MissingData))
    }
}
