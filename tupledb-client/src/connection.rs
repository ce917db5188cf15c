//! Connection management: socket ownership, worker loops, reconnection.

use crate::error::ClientError;
use crate::future::ResponseFuture;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tupledb_protocol::{frame, scramble, Greeting, Request, Response, GREETING_SIZE};

/// Default read buffer size (128 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Capacity of the outbound packet queue.
const PACKET_QUEUE_CAPACITY: usize = 64;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on dialing, greeting and authentication.
    pub connect_timeout: Duration,
    /// Per-request deadline; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Backoff between reconnect attempts; `None` disables reconnection.
    pub reconnect_after: Option<Duration>,
    /// Failed reconnect attempts tolerated before the connection is closed
    /// for good; 0 retries forever.
    pub max_reconnects: u32,
    /// Username; authentication is skipped when unset.
    pub user: Option<String>,
    /// Password paired with `user`.
    pub password: String,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            reconnect_after: None,
            max_reconnects: 0,
            user: None,
            password: String::new(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_reconnect(mut self, after: Duration, max_reconnects: u32) -> Self {
        self.reconnect_after = Some(after);
        self.max_reconnects = max_reconnects;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = password.into();
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Buffered frame reader over the read half of the socket.
struct FrameReader {
    io: OwnedReadHalf,
    buf: BytesMut,
    chunk: usize,
}

impl FrameReader {
    fn new(io: OwnedReadHalf, chunk: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(chunk),
            chunk,
        }
    }

    fn eof() -> ClientError {
        ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        ))
    }

    /// Reads one length-prefixed frame body.
    async fn read_frame(&mut self) -> Result<Bytes, ClientError> {
        loop {
            if let Some(body) = frame::decode(&mut self.buf)? {
                return Ok(body);
            }
            self.buf.reserve(self.chunk);
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(Self::eof());
            }
        }
    }

    /// Reads exactly `out.len()` raw bytes (the greeting precedes framing).
    async fn read_exact(&mut self, out: &mut [u8]) -> Result<(), ClientError> {
        while self.buf.len() < out.len() {
            self.buf.reserve(self.chunk);
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(Self::eof());
            }
        }
        out.copy_from_slice(&self.buf.split_to(out.len()));
        Ok(())
    }
}

struct DialedSocket {
    reader: FrameReader,
    writer: BufWriter<OwnedWriteHalf>,
    greeting: Greeting,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

type PendingMap = HashMap<u32, oneshot::Sender<Result<Response, ClientError>>>;

/// State behind the connection's single mutex: the socket, its halves
/// parked for the worker loops, and the outstanding-request map.
struct ConnState {
    /// Permanently closed; set by `close` or by exhausted reconnects.
    closed: bool,
    /// A dialed socket exists for the current generation.
    live: bool,
    /// Bumped on every successful dial. A stale half carries its old
    /// generation and cannot tear down a newer socket.
    generation: u64,
    reader: Option<FrameReader>,
    writer: Option<BufWriter<OwnedWriteHalf>>,
    pending: PendingMap,
    greeting: Option<Greeting>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

fn install_socket(st: &mut ConnState, socket: DialedSocket) {
    st.generation += 1;
    st.live = true;
    st.reader = Some(socket.reader);
    st.writer = Some(socket.writer);
    st.greeting = Some(socket.greeting);
    st.peer_addr = socket.peer_addr;
    st.local_addr = socket.local_addr;
}

fn fail_pending(pending: &mut PendingMap, err: impl Fn() -> ClientError) {
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(err()));
    }
}

/// Exclusive owner of one socket. Two worker loops (writer, reader) move
/// frames; callers correlate through the pending map.
pub struct Connection {
    addr: String,
    config: ConnectionConfig,
    state: Mutex<ConnState>,
    packets: mpsc::Sender<Vec<u8>>,
    sync_counter: AtomicU32,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    pub(crate) fn new(addr: String, config: ConnectionConfig) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (packets, packets_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let conn = Arc::new(Self {
            addr,
            config,
            state: Mutex::new(ConnState {
                closed: false,
                live: false,
                generation: 0,
                reader: None,
                writer: None,
                pending: HashMap::new(),
                greeting: None,
                peer_addr: None,
                local_addr: None,
            }),
            packets,
            sync_counter: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            shutdown,
        });
        (conn, packets_rx)
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Allocates the next correlation id. Monotonic per connection; wraps
    /// after `u32::MAX`, long after older ids have resolved.
    pub(crate) fn next_sync(&self) -> u32 {
        self.sync_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Whether the connection is permanently closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Greeting of the most recent successful dial.
    pub async fn greeting(&self) -> Option<Greeting> {
        self.state.lock().await.greeting.clone()
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.peer_addr
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.local_addr
    }

    /// Number of requests waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Marks the connection permanently closed, wakes both worker loops,
    /// and fails every outstanding request.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let mut st = self.state.lock().await;
        st.closed = true;
        st.live = false;
        st.reader = None;
        st.writer = None;
        let outstanding = st.pending.len();
        fail_pending(&mut st.pending, || ClientError::ConnectionClosed);
        tracing::debug!(outstanding, "connection closed");
    }

    async fn closed_signal(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    /// One dial attempt with reconnection semantics disabled; a failed
    /// first attempt is fatal to `connect`.
    pub(crate) async fn initial_dial(&self) -> Result<(), ClientError> {
        let socket = self.dial().await?;
        let mut st = self.state.lock().await;
        install_socket(&mut st, socket);
        Ok(())
    }

    /// Opens the raw stream, reads the greeting, and authenticates when
    /// credentials are configured. The whole sequence is bounded by
    /// `connect_timeout`.
    async fn dial(&self) -> Result<DialedSocket, ClientError> {
        let connect = async {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true).ok();
            let peer_addr = stream.peer_addr().ok();
            let local_addr = stream.local_addr().ok();
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half, self.config.read_buffer_size);
            let mut writer = BufWriter::new(write_half);

            let mut raw = [0u8; GREETING_SIZE];
            reader.read_exact(&mut raw).await?;
            let greeting = Greeting::parse(&raw)?;
            tracing::debug!(version = %greeting.version, "greeting received");

            if let Some(user) = &self.config.user {
                let scr = scramble(greeting.salt(), &self.config.password)?;
                let request = Request::auth(user, self.next_sync(), &scr)?;
                writer.write_all(&request.pack()).await?;
                writer.flush().await?;

                let frame = reader.read_frame().await?;
                let mut response = Response::parse(frame)?;
                response.decode_body()?;
                response.check()?;
                tracing::debug!(user = %user, "authenticated");
            }

            Ok(DialedSocket {
                reader,
                writer,
                greeting,
                peer_addr,
                local_addr,
            })
        };
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectTimeout),
        }
    }

    /// Redials under the state lock so only one worker re-establishes the
    /// socket. Retries per the reconnect policy; exhausting the attempt
    /// budget closes the connection for good.
    async fn redial(&self, st: &mut ConnState) -> Result<(), ClientError> {
        let mut attempts: u32 = 0;
        loop {
            if st.closed || self.is_closed() {
                return Err(ClientError::ConnectionClosed);
            }
            let err = match self.dial().await {
                Ok(socket) => {
                    install_socket(st, socket);
                    if attempts > 0 {
                        tracing::info!(addr = %self.addr, attempts, "reconnected");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };
            let Some(backoff) = self.config.reconnect_after else {
                return Err(err);
            };
            attempts += 1;
            if self.config.max_reconnects > 0 && attempts > self.config.max_reconnects {
                tracing::error!(
                    addr = %self.addr,
                    error = %err,
                    "reconnect attempts exhausted, closing connection"
                );
                st.closed = true;
                self.closed.store(true, Ordering::SeqCst);
                let _ = self.shutdown.send(true);
                fail_pending(&mut st.pending, || ClientError::ConnectionClosed);
                return Err(ClientError::ConnectionClosed);
            }
            tracing::warn!(
                addr = %self.addr,
                attempt = attempts,
                max = self.config.max_reconnects,
                error = %err,
                "reconnect failed"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.closed_signal() => return Err(ClientError::ConnectionClosed),
            }
        }
    }

    async fn claim_reader(&self) -> Result<(FrameReader, u64), ClientError> {
        let mut st = self.state.lock().await;
        loop {
            if st.closed || self.is_closed() {
                return Err(ClientError::ConnectionClosed);
            }
            if !st.live {
                self.redial(&mut st).await?;
            }
            match st.reader.take() {
                Some(reader) => return Ok((reader, st.generation)),
                None => st.live = false,
            }
        }
    }

    async fn claim_writer(&self) -> Result<(BufWriter<OwnedWriteHalf>, u64), ClientError> {
        let mut st = self.state.lock().await;
        loop {
            if st.closed || self.is_closed() {
                return Err(ClientError::ConnectionClosed);
            }
            if !st.live {
                self.redial(&mut st).await?;
            }
            match st.writer.take() {
                Some(writer) => return Ok((writer, st.generation)),
                None => st.live = false,
            }
        }
    }

    /// Tears down the current socket after an I/O failure. In-flight
    /// requests fail with the cause; the logical connection stays open so
    /// the next claim redials.
    async fn drop_socket(&self, generation: u64, cause: &ClientError) {
        let mut st = self.state.lock().await;
        if !st.live || st.generation != generation {
            return;
        }
        tracing::warn!(error = %cause, "socket failure, dropping connection");
        st.live = false;
        st.reader = None;
        st.writer = None;
        st.peer_addr = None;
        st.local_addr = None;
        let message = cause.to_string();
        fail_pending(&mut st.pending, || ClientError::ConnectionLost(message.clone()));
    }

    /// Registers a request and hands its packet to the writer loop. The
    /// bounded queue applies backpressure when full.
    pub(crate) async fn issue(self: Arc<Self>, request: Request) -> ResponseFuture {
        let sync = request.sync();
        let packet = request.pack();

        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock().await;
            if st.closed || self.is_closed() {
                return ResponseFuture::failed(ClientError::ConnectionClosed);
            }
            if !st.live {
                return ResponseFuture::failed(ClientError::NotConnected);
            }
            st.pending.insert(sync, tx);
        }

        let submitted = tokio::select! {
            result = self.packets.send(packet) => result.map_err(|_| ClientError::ConnectionClosed),
            _ = self.closed_signal() => Err(ClientError::ConnectionClosed),
        };
        if let Err(err) = submitted {
            self.state.lock().await.pending.remove(&sync);
            return ResponseFuture::failed(err);
        }

        ResponseFuture::pending(self, sync, rx)
    }

    /// Removes a request registration. The timeout path calls this so a
    /// late response is dropped by the reader instead of resolving a dead
    /// handle.
    pub(crate) async fn forget(&self, sync: u32) -> bool {
        self.state.lock().await.pending.remove(&sync).is_some()
    }

    async fn dispatch(&self, response: Response) {
        let sync = response.sync;
        let waiter = self.state.lock().await.pending.remove(&sync);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => tracing::warn!(sync, "response for unknown sync, dropping"),
        }
    }

    async fn shutdown_on(&self, err: ClientError) {
        if !matches!(err, ClientError::ConnectionClosed) {
            tracing::error!(error = %err, "worker cannot reacquire socket, closing connection");
        }
        self.close().await;
    }

    /// Outbound worker: drains the packet queue eagerly and flushes
    /// buffered output only when the queue runs momentarily empty.
    pub(crate) async fn writer_loop(self: Arc<Self>, mut packets: mpsc::Receiver<Vec<u8>>) {
        let mut sink: Option<(BufWriter<OwnedWriteHalf>, u64)> = None;
        loop {
            let packet = match packets.try_recv() {
                Ok(packet) => packet,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if let Some((writer, generation)) = sink.as_mut() {
                        if let Err(err) = writer.flush().await {
                            let err = ClientError::Io(err);
                            self.drop_socket(*generation, &err).await;
                            sink = None;
                        }
                    }
                    tokio::select! {
                        received = packets.recv() => match received {
                            Some(packet) => packet,
                            None => return,
                        },
                        _ = self.closed_signal() => return,
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            };

            if sink.is_none() {
                match self.claim_writer().await {
                    Ok(claimed) => sink = Some(claimed),
                    Err(err) => {
                        self.shutdown_on(err).await;
                        return;
                    }
                }
            }
            let Some((writer, generation)) = sink.as_mut() else {
                return;
            };
            if let Err(err) = writer.write_all(&packet).await {
                // The packet dies with the socket; its future fails in
                // drop_socket. The next packet triggers a fresh claim.
                let err = ClientError::Io(err);
                self.drop_socket(*generation, &err).await;
                sink = None;
            }
        }
    }

    /// Inbound worker: reads one frame at a time, decodes its header, and
    /// resolves the matching future.
    pub(crate) async fn reader_loop(self: Arc<Self>) {
        let mut source: Option<(FrameReader, u64)> = None;
        loop {
            if source.is_none() {
                match self.claim_reader().await {
                    Ok(claimed) => source = Some(claimed),
                    Err(err) => {
                        self.shutdown_on(err).await;
                        return;
                    }
                }
            }
            let Some((reader, generation)) = source.as_mut() else {
                return;
            };
            let received = tokio::select! {
                frame = reader.read_frame() => frame,
                _ = self.closed_signal() => return,
            };
            match received.and_then(|frame| Response::parse(frame).map_err(ClientError::from)) {
                Ok(response) => self.dispatch(response).await,
                Err(err) => {
                    self.drop_socket(*generation, &err).await;
                    source = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.reconnect_after, None);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert!(config.user.is_none());
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new().with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new().with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_sync_ids_are_monotonic() {
        let (conn, _rx) = Connection::new("127.0.0.1:1".into(), ConnectionConfig::new());
        let first = conn.next_sync();
        let second = conn.next_sync();
        let third = conn.next_sync();
        assert_eq!(second, first + 1);
        assert_eq!(third, second + 1);
    }

    #[test]
    fn test_sync_ids_wrap() {
        let (conn, _rx) = Connection::new("127.0.0.1:1".into(), ConnectionConfig::new());
        conn.sync_counter.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(conn.next_sync(), u32::MAX);
        assert_eq!(conn.next_sync(), 0);
        assert_eq!(conn.next_sync(), 1);
    }
}
