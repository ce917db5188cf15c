//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::future::ResponseFuture;
use crate::schema::{self, IndexRef, Schema, SpaceRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tupledb_protocol::{field, Greeting, IteratorKind, Request, RequestCode, Response};

/// High-level client: one physical connection multiplexing many concurrent
/// logical requests.
///
/// Cloning is cheap and shares the underlying connection.
#[derive(Clone)]
pub struct Client {
    conn: Arc<Connection>,
    schema: Arc<Schema>,
}

impl Client {
    /// Connects, authenticates, starts the worker loops, and loads the
    /// schema.
    ///
    /// The initial dial runs with reconnection semantics disabled: a failed
    /// first attempt is fatal. A schema-load failure tears the connection
    /// down and surfaces the error.
    pub async fn connect(
        addr: impl Into<String>,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError> {
        let addr = addr.into();
        tracing::debug!(addr = %addr, "connecting");
        let (conn, packets_rx) = Connection::new(addr, config);
        conn.initial_dial().await?;

        Self::spawn_workers(&conn, packets_rx);

        let schema = match schema::load(&conn).await {
            Ok(schema) => Arc::new(schema),
            Err(err) => {
                tracing::error!(error = %err, "schema load failed, tearing down");
                conn.close().await;
                return Err(err);
            }
        };

        Ok(Self { conn, schema })
    }

    fn spawn_workers(conn: &Arc<Connection>, packets_rx: mpsc::Receiver<Vec<u8>>) {
        tokio::spawn(Connection::writer_loop(conn.clone(), packets_rx));
        tokio::spawn(Connection::reader_loop(conn.clone()));
    }

    /// Catalog snapshot loaded at connect time.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Closes the connection and fails every outstanding request.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Greeting of the most recent successful dial.
    pub async fn greeting(&self) -> Option<Greeting> {
        self.conn.greeting().await
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr().await
    }

    /// Number of requests currently waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.conn.pending_count().await
    }

    // =========================================================================
    // Request builders
    // =========================================================================

    fn search_request<K>(
        &self,
        code: RequestCode,
        space: SpaceRef<'_>,
        index: IndexRef<'_>,
        key: &K,
    ) -> Result<Request, ClientError>
    where
        K: Serialize + ?Sized,
    {
        let (space_id, index_id) = self.schema.resolve(space, Some(index))?;
        let mut request = Request::new(code, self.conn.next_sync());
        request.fill_search(space_id, index_id, key)?;
        Ok(request)
    }

    fn store_request<T>(
        &self,
        code: RequestCode,
        space: SpaceRef<'_>,
        tuple: &T,
    ) -> Result<Request, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let (space_id, _) = self.schema.resolve(space, None)?;
        let mut request = Request::new(code, self.conn.next_sync());
        request.set(field::SPACE_ID, &space_id)?;
        request.set(field::TUPLE, tuple)?;
        Ok(request)
    }

    async fn issue(&self, built: Result<Request, ClientError>) -> ResponseFuture {
        match built {
            Ok(request) => self.conn.clone().issue(request).await,
            Err(err) => ResponseFuture::failed(err),
        }
    }

    // =========================================================================
    // System operations
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<Response, ClientError> {
        let request = Request::new(RequestCode::Ping, self.conn.next_sync());
        self.conn.clone().issue(request).await.get().await
    }

    // =========================================================================
    // Select
    // =========================================================================

    pub async fn select_async<'a, K>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        offset: u32,
        limit: u32,
        iterator: IteratorKind,
        key: &K,
    ) -> ResponseFuture
    where
        K: Serialize + ?Sized,
    {
        let built = self
            .search_request(RequestCode::Select, space.into(), index.into(), key)
            .and_then(|mut request| {
                request.fill_iterator(iterator, offset, limit)?;
                Ok(request)
            });
        self.issue(built).await
    }

    pub async fn select<'a, K>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        offset: u32,
        limit: u32,
        iterator: IteratorKind,
        key: &K,
    ) -> Result<Response, ClientError>
    where
        K: Serialize + ?Sized,
    {
        self.select_async(space, index, offset, limit, iterator, key)
            .await
            .get()
            .await
    }

    pub async fn select_typed<'a, K, R>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        offset: u32,
        limit: u32,
        iterator: IteratorKind,
        key: &K,
    ) -> Result<R, ClientError>
    where
        K: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.select_async(space, index, offset, limit, iterator, key)
            .await
            .get_typed()
            .await
    }

    // =========================================================================
    // Insert / Replace
    // =========================================================================

    pub async fn insert_async<'a, T>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
    ) -> ResponseFuture
    where
        T: Serialize + ?Sized,
    {
        let built = self.store_request(RequestCode::Insert, space.into(), tuple);
        self.issue(built).await
    }

    pub async fn insert<'a, T>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
    ) -> Result<Response, ClientError>
    where
        T: Serialize + ?Sized,
    {
        self.insert_async(space, tuple).await.get().await
    }

    pub async fn insert_typed<'a, T, R>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
    ) -> Result<R, ClientError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.insert_async(space, tuple).await.get_typed().await
    }

    pub async fn replace_async<'a, T>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
    ) -> ResponseFuture
    where
        T: Serialize + ?Sized,
    {
        let built = self.store_request(RequestCode::Replace, space.into(), tuple);
        self.issue(built).await
    }

    pub async fn replace<'a, T>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
    ) -> Result<Response, ClientError>
    where
        T: Serialize + ?Sized,
    {
        self.replace_async(space, tuple).await.get().await
    }

    pub async fn replace_typed<'a, T, R>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
    ) -> Result<R, ClientError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.replace_async(space, tuple).await.get_typed().await
    }

    // =========================================================================
    // Delete
    // =========================================================================

    pub async fn delete_async<'a, K>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: &K,
    ) -> ResponseFuture
    where
        K: Serialize + ?Sized,
    {
        let built = self.search_request(RequestCode::Delete, space.into(), index.into(), key);
        self.issue(built).await
    }

    pub async fn delete<'a, K>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: &K,
    ) -> Result<Response, ClientError>
    where
        K: Serialize + ?Sized,
    {
        self.delete_async(space, index, key).await.get().await
    }

    pub async fn delete_typed<'a, K, R>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: &K,
    ) -> Result<R, ClientError>
    where
        K: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.delete_async(space, index, key).await.get_typed().await
    }

    // =========================================================================
    // Update / Upsert
    // =========================================================================

    pub async fn update_async<'a, K, O>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: &K,
        ops: &O,
    ) -> ResponseFuture
    where
        K: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        let built = self
            .search_request(RequestCode::Update, space.into(), index.into(), key)
            .and_then(|mut request| {
                request.set(field::TUPLE, ops)?;
                Ok(request)
            });
        self.issue(built).await
    }

    pub async fn update<'a, K, O>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: &K,
        ops: &O,
    ) -> Result<Response, ClientError>
    where
        K: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        self.update_async(space, index, key, ops).await.get().await
    }

    pub async fn update_typed<'a, K, O, R>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        index: impl Into<IndexRef<'a>>,
        key: &K,
        ops: &O,
    ) -> Result<R, ClientError>
    where
        K: Serialize + ?Sized,
        O: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.update_async(space, index, key, ops)
            .await
            .get_typed()
            .await
    }

    pub async fn upsert_async<'a, T, O>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
        ops: &O,
    ) -> ResponseFuture
    where
        T: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        let built = self
            .store_request(RequestCode::Upsert, space.into(), tuple)
            .and_then(|mut request| {
                request.set(field::OPS, ops)?;
                Ok(request)
            });
        self.issue(built).await
    }

    pub async fn upsert<'a, T, O>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
        ops: &O,
    ) -> Result<Response, ClientError>
    where
        T: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        self.upsert_async(space, tuple, ops).await.get().await
    }

    pub async fn upsert_typed<'a, T, O, R>(
        &self,
        space: impl Into<SpaceRef<'a>>,
        tuple: &T,
        ops: &O,
    ) -> Result<R, ClientError>
    where
        T: Serialize + ?Sized,
        O: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.upsert_async(space, tuple, ops)
            .await
            .get_typed()
            .await
    }

    // =========================================================================
    // Call / Eval
    // =========================================================================

    fn call_request<A>(&self, function: &str, args: &A) -> Result<Request, ClientError>
    where
        A: Serialize + ?Sized,
    {
        let mut request = Request::new(RequestCode::Call, self.conn.next_sync());
        request.set(field::FUNCTION_NAME, function)?;
        request.set(field::TUPLE, args)?;
        Ok(request)
    }

    pub async fn call_async<A>(&self, function: &str, args: &A) -> ResponseFuture
    where
        A: Serialize + ?Sized,
    {
        let built = self.call_request(function, args);
        self.issue(built).await
    }

    pub async fn call<A>(&self, function: &str, args: &A) -> Result<Response, ClientError>
    where
        A: Serialize + ?Sized,
    {
        self.call_async(function, args).await.get().await
    }

    pub async fn call_typed<A, R>(&self, function: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_async(function, args).await.get_typed().await
    }

    fn eval_request<A>(&self, expression: &str, args: &A) -> Result<Request, ClientError>
    where
        A: Serialize + ?Sized,
    {
        let mut request = Request::new(RequestCode::Eval, self.conn.next_sync());
        request.set(field::EXPRESSION, expression)?;
        request.set(field::TUPLE, args)?;
        Ok(request)
    }

    pub async fn eval_async<A>(&self, expression: &str, args: &A) -> ResponseFuture
    where
        A: Serialize + ?Sized,
    {
        let built = self.eval_request(expression, args);
        self.issue(built).await
    }

    pub async fn eval<A>(&self, expression: &str, args: &A) -> Result<Response, ClientError>
    where
        A: Serialize + ?Sized,
    {
        self.eval_async(expression, args).await.get().await
    }

    pub async fn eval_typed<A, R>(&self, expression: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.eval_async(expression, args).await.get_typed().await
    }
}
