//! Network transport for Raft RPCs.
//!
//! [`NetworkTransport`] moves AppendEntries, RequestVote, InstallSnapshot,
//! and TimeoutNow between peers over a [`StreamLayer`]. Outbound RPCs go
//! through a per-peer LIFO pool of idle connections; inbound connections are
//! served by one handler task each, fed from a single accept loop with
//! bounded exponential backoff on accept failures.
//!
//! Decoded requests are delivered as [`RaftRpc`] envelopes on a bounded
//! consumer channel. Empty-entry AppendEntries requests can bypass the
//! channel entirely via an optional heartbeat handler, keeping election
//! timing stable while the consumer is busy applying entries.
//!
//! ```text
//!  caller ──> pool ──> framed stream ──> accept loop ──> handler task
//!                                                            │
//!                        consumer channel  <── envelope ─────┘
//! ```

mod pipeline;

pub use pipeline::{AppendEntriesPipeline, PipelineResult};

use crate::config::NetworkConfig;
use crate::error::{RaftNetError, Result};
use crate::stream::{Connection, StreamLayer};
use crate::types::{
    AddressProvider, AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftRpc, RequestVoteRequest, RequestVoteResponse, RpcCommand,
    RpcResponder, RpcResult, ServerAddress, ServerId, TimeoutNowRequest, TimeoutNowResponse,
};
use crate::wire;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// Capacity of the consumer channel. One envelope per handler task can be
/// queued; a slow consumer stalls one connection at a time, never all.
const CONSUMER_CAPACITY: usize = 1;

/// Initial accept-failure backoff.
const ACCEPT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Accept-failure backoff ceiling.
const ACCEPT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Read chunk size when relaying an InstallSnapshot body to the consumer.
const SNAPSHOT_CHUNK: usize = 16 * 1024;

/// Callback invoked synchronously for heartbeat AppendEntries requests,
/// bypassing the consumer channel.
pub type HeartbeatHandler = Arc<dyn Fn(RaftRpc) + Send + Sync>;

/// An outbound connection with buffered framing state.
struct NetConn {
    target: ServerAddress,
    stream: BufStream<Box<dyn Connection>>,
}

impl NetConn {
    fn new(target: ServerAddress, conn: Box<dyn Connection>) -> Self {
        Self {
            target,
            stream: BufStream::new(conn),
        }
    }

    async fn send_request<T: Serialize>(&mut self, kind: u8, body: &T) -> Result<()> {
        wire::write_request(&mut self.stream, kind, body).await
    }

    async fn read_typed<T: DeserializeOwned>(&mut self) -> Result<T> {
        let body = wire::read_response(&mut self.stream).await?;
        wire::decode_body(&body)
    }
}

struct TransportInner {
    stream: Arc<dyn StreamLayer>,
    config: NetworkConfig,
    address_provider: Option<Arc<dyn AddressProvider>>,

    /// Idle outbound connections, LIFO per target.
    pool: Mutex<HashMap<ServerAddress, Vec<NetConn>>>,

    consumer_tx: mpsc::Sender<RaftRpc>,
    consumer_rx: Mutex<Option<mpsc::Receiver<RaftRpc>>>,

    heartbeat: RwLock<Option<HeartbeatHandler>>,

    /// Bumped by `close_streams` so live inbound handlers tear down their
    /// connections, mirroring the drained outbound pool.
    stream_epoch: watch::Sender<u64>,

    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TransportInner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Stream-protocol transport between Raft peers. Cheap to clone; all clones
/// share the pool, accept loop, and consumer channel.
#[derive(Clone)]
pub struct NetworkTransport {
    inner: Arc<TransportInner>,
}

impl NetworkTransport {
    /// Start a transport over `stream`. Spawns the accept loop immediately.
    pub fn new(stream: Arc<dyn StreamLayer>, config: NetworkConfig) -> Result<Self> {
        Self::with_address_provider(stream, config, None)
    }

    /// Start a transport with an optional [`AddressProvider`] that rewrites
    /// dial targets and encoded peer addresses.
    pub fn with_address_provider(
        stream: Arc<dyn StreamLayer>,
        config: NetworkConfig,
        address_provider: Option<Arc<dyn AddressProvider>>,
    ) -> Result<Self> {
        config.validate()?;

        let (consumer_tx, consumer_rx) = mpsc::channel(CONSUMER_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stream_epoch, _) = watch::channel(0u64);

        let inner = Arc::new(TransportInner {
            stream,
            config,
            address_provider,
            pool: Mutex::new(HashMap::new()),
            consumer_tx,
            consumer_rx: Mutex::new(Some(consumer_rx)),
            heartbeat: RwLock::new(None),
            stream_epoch,
            shutdown: AtomicBool::new(false),
            shutdown_tx,
        });

        tokio::spawn(listen(inner.clone(), shutdown_rx));

        Ok(Self { inner })
    }

    /// The address peers should dial to reach this transport.
    pub fn local_addr(&self) -> ServerAddress {
        self.inner.stream.local_addr()
    }

    /// Take the consumer end of the RPC channel. May be called once.
    ///
    /// # Panics
    ///
    /// Panics if the consumer has already been taken.
    pub fn consumer(&self) -> mpsc::Receiver<RaftRpc> {
        self.inner
            .consumer_rx
            .lock()
            .take()
            .expect("transport consumer already taken")
    }

    /// Install a callback that handles heartbeat AppendEntries requests
    /// without going through the consumer channel.
    pub fn set_heartbeat_handler<F>(&self, handler: F)
    where
        F: Fn(RaftRpc) + Send + Sync + 'static,
    {
        *self.inner.heartbeat.write() = Some(Arc::new(handler));
    }

    /// Serialize a peer for storage in committed configuration entries.
    /// Uses the address provider's translation when one is configured.
    pub fn encode_peer(&self, id: &ServerId, addr: &ServerAddress) -> Result<Vec<u8>> {
        let addr = self.target_address(id, addr);
        wire::encode_peer(&addr)
    }

    /// Inverse of [`encode_peer`](Self::encode_peer).
    pub fn decode_peer(&self, bytes: &[u8]) -> Result<ServerAddress> {
        wire::decode_peer(bytes)
    }

    /// Replicate entries (or heartbeat) to a peer.
    pub async fn append_entries(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let timeout = self.scaled_timeout(req.entries.len());
        self.generic_rpc(id, target, wire::RPC_APPEND_ENTRIES, req, timeout)
            .await
    }

    /// Ask a peer for its vote.
    pub async fn request_vote(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        req: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let timeout = self.base_timeout();
        self.generic_rpc(id, target, wire::RPC_REQUEST_VOTE, req, timeout)
            .await
    }

    /// Tell a peer to start an election immediately.
    pub async fn timeout_now(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        req: &TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        let timeout = self.base_timeout();
        self.generic_rpc(id, target, wire::RPC_TIMEOUT_NOW, req, timeout)
            .await
    }

    /// Push a snapshot to a peer. The framed request is followed by exactly
    /// `req.size` bytes read from `body`.
    ///
    /// Unlike the other RPCs this is never retried on a stale pooled
    /// connection: `body` cannot be rewound once partially streamed.
    pub async fn install_snapshot<R>(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        req: &InstallSnapshotRequest,
        body: &mut R,
    ) -> Result<InstallSnapshotResponse>
    where
        R: AsyncRead + Send + Unpin,
    {
        let target = self.target_address(id, target);
        let (mut conn, _pooled) = self.get_conn(&target).await?;

        let deadline = self.scaled_timeout(req.size as usize);
        let mut req = req.clone();
        req.header.protocol_version = self.inner.config.protocol_version;

        let exchange = async {
            conn.send_request(wire::RPC_INSTALL_SNAPSHOT, &req).await?;
            let mut limited = body.take(req.size);
            tokio::io::copy(&mut limited, &mut conn.stream).await?;
            conn.stream.flush().await?;
            conn.read_typed::<InstallSnapshotResponse>().await
        };

        match apply_deadline(deadline, exchange).await {
            Ok(resp) => {
                self.return_conn(conn);
                Ok(resp)
            }
            Err(err) if err.is_remote() => {
                self.return_conn(conn);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Open a pipelined AppendEntries connection to a peer. Fails with
    /// [`RaftNetError::PipelineReplicationNotSupported`] when
    /// `max_rpcs_in_flight` is configured to 1.
    pub async fn append_entries_pipeline(
        &self,
        id: &ServerId,
        target: &ServerAddress,
    ) -> Result<AppendEntriesPipeline> {
        if self.inner.config.max_rpcs_in_flight == 1 {
            return Err(RaftNetError::PipelineReplicationNotSupported);
        }

        let target = self.target_address(id, target);
        let (conn, _pooled) = self.get_conn(&target).await?;

        let max_in_flight = self.inner.config.effective_max_rpcs_in_flight();
        Ok(AppendEntriesPipeline::start(
            conn.stream,
            max_in_flight,
            self.inner.config.protocol_version,
        ))
    }

    /// Close every idle pooled connection and tear down live inbound
    /// handler connections, leaving the transport running. In-flight
    /// outbound RPCs are not disturbed; their next reuse of a previously
    /// pooled connection fails and they dial fresh.
    pub fn close_streams(&self) {
        let drained: Vec<NetConn> = {
            let mut pool = self.inner.pool.lock();
            pool.drain().flat_map(|(_, conns)| conns).collect()
        };
        debug!(count = drained.len(), "closed pooled connections");
        // Dropping closes the sockets.
        drop(drained);

        // Inbound handlers watch the epoch and close their connections,
        // which peers observe as EOF.
        self.inner.stream_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Shut the transport down. Idempotent. The accept loop exits, pooled
    /// connections close, and subsequent RPCs fail with
    /// [`RaftNetError::TransportShutdown`].
    pub fn close(&self) {
        if self
            .inner
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.inner.shutdown_tx.send(true);
            self.close_streams();
        }
    }

    fn base_timeout(&self) -> Option<Duration> {
        let timeout = self.inner.config.timeout;
        if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        }
    }

    /// Deadline scaled linearly with payload size so large batches are not
    /// penalized by the base timeout.
    fn scaled_timeout(&self, units: usize) -> Option<Duration> {
        let factor = (units / self.inner.config.timeout_scale).max(1) as u32;
        self.base_timeout().map(|t| t * factor)
    }

    fn target_address(&self, id: &ServerId, fallback: &ServerAddress) -> ServerAddress {
        if let Some(provider) = &self.inner.address_provider {
            match provider.server_addr(id) {
                Ok(addr) => return addr,
                Err(err) => {
                    warn!(
                        id = %id,
                        error = %err,
                        "address provider lookup failed, using fallback address"
                    );
                }
            }
        }
        fallback.clone()
    }

    /// Pop an idle connection for `target` or dial a new one. The boolean is
    /// true when the connection came out of the pool.
    async fn get_conn(&self, target: &ServerAddress) -> Result<(NetConn, bool)> {
        if self.inner.is_shutdown() {
            return Err(RaftNetError::TransportShutdown);
        }

        let pooled = {
            let mut pool = self.inner.pool.lock();
            pool.get_mut(target).and_then(Vec::pop)
        };
        if let Some(conn) = pooled {
            return Ok((conn, true));
        }

        let raw = self
            .inner
            .stream
            .dial(target, self.inner.config.timeout)
            .await?;
        Ok((NetConn::new(target.clone(), raw), false))
    }

    /// Return a connection to the pool, closing it instead when the per-key
    /// capacity is full or the transport is shutting down.
    fn return_conn(&self, conn: NetConn) {
        let mut pool = self.inner.pool.lock();
        if self.inner.is_shutdown() {
            return; // dropped, which closes it
        }
        let conns = pool.entry(conn.target.clone()).or_default();
        if conns.len() < self.inner.config.max_pool {
            conns.push(conn);
        }
    }

    /// Single-shot RPC exchange over a pooled connection. A stale pooled
    /// connection that fails with an I/O error is replaced by one fresh dial
    /// before the error is surfaced.
    async fn generic_rpc<T, U>(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        kind: u8,
        req: &T,
        deadline: Option<Duration>,
    ) -> Result<U>
    where
        T: Serialize + Clone + WithHeader,
        U: DeserializeOwned,
    {
        let target = self.target_address(id, target);
        let mut req = req.clone();
        req.set_protocol_version(self.inner.config.protocol_version);

        let (conn, pooled) = self.get_conn(&target).await?;
        match self.exchange(conn, kind, &req, deadline).await {
            Err(err @ RaftNetError::Io(_)) if pooled => {
                // The pooled socket was likely reset while idle. One fresh
                // dial before giving up.
                debug!(target = %target, error = %err, "retrying rpc on fresh connection");
                let (conn, _) = self.get_conn(&target).await?;
                self.exchange(conn, kind, &req, deadline).await
            }
            other => other,
        }
    }

    async fn exchange<T, U>(
        &self,
        mut conn: NetConn,
        kind: u8,
        req: &T,
        deadline: Option<Duration>,
    ) -> Result<U>
    where
        T: Serialize,
        U: DeserializeOwned,
    {
        let exchange = async {
            conn.send_request(kind, req).await?;
            conn.stream.flush().await?;
            conn.read_typed::<U>().await
        };

        match apply_deadline(deadline, exchange).await {
            Ok(resp) => {
                self.return_conn(conn);
                Ok(resp)
            }
            Err(err) if err.is_remote() => {
                // The peer answered; the framing is intact and the
                // connection stays reusable.
                self.return_conn(conn);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    #[cfg(test)]
    fn pooled_conns(&self, target: &ServerAddress) -> usize {
        self.inner
            .pool
            .lock()
            .get(target)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Stamp the configured protocol version into an outbound request header.
trait WithHeader {
    fn set_protocol_version(&mut self, version: u64);
}

macro_rules! impl_with_header {
    ($($ty:ty),*) => {
        $(impl WithHeader for $ty {
            fn set_protocol_version(&mut self, version: u64) {
                self.header.protocol_version = version;
            }
        })*
    };
}

impl_with_header!(
    AppendEntriesRequest,
    RequestVoteRequest,
    InstallSnapshotRequest,
    TimeoutNowRequest
);

impl crate::snapshot::PeerEncoder for NetworkTransport {
    fn encode_peer(&self, id: &ServerId, addr: &ServerAddress) -> Result<Vec<u8>> {
        NetworkTransport::encode_peer(self, id, addr)
    }
}

async fn apply_deadline<T>(
    deadline: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| RaftNetError::Timeout(d.as_millis() as u64))?,
        None => fut.await,
    }
}

/// Accept loop. Failures back off exponentially from 5 ms to 1 s, resetting
/// on the next successful accept; shutdown cancels the backoff sleep.
async fn listen(inner: Arc<TransportInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut backoff = Duration::ZERO;
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => return,
            res = inner.stream.accept() => res,
        };

        match accepted {
            Ok(conn) => {
                backoff = Duration::ZERO;
                let epoch_rx = inner.stream_epoch.subscribe();
                tokio::spawn(handle_conn(inner.clone(), conn, shutdown_rx.clone(), epoch_rx));
            }
            Err(err) => {
                if inner.is_shutdown() {
                    return;
                }

                backoff = if backoff.is_zero() {
                    ACCEPT_BASE_DELAY
                } else {
                    (backoff * 2).min(ACCEPT_MAX_DELAY)
                };
                error!(error = %err, "failed to accept connection");

                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// Per-connection handler: decode frames, dispatch envelopes, write
/// responses back, until EOF, error, or shutdown.
async fn handle_conn(
    inner: Arc<TransportInner>,
    conn: Box<dyn Connection>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut epoch_rx: watch::Receiver<u64>,
) {
    let mut stream = BufStream::new(conn);

    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = epoch_rx.changed() => {
                debug!("stream layer is closed");
                return;
            }
            res = wire::read_request(&mut stream) => res,
        };

        let (kind, body) = match frame {
            Ok(frame) => frame,
            Err(RaftNetError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => return,
            Err(err) => {
                debug!(error = %err, "failed to read inbound frame");
                return;
            }
        };

        if let Err(err) =
            handle_command(&inner, &mut stream, kind, &body, &mut shutdown_rx, &mut epoch_rx).await
        {
            if !inner.is_shutdown() {
                debug!(error = %err, "failed to handle inbound command");
            }
            return;
        }

        if let Err(err) = stream.flush().await {
            debug!(error = %err, "failed to flush response");
            return;
        }
    }
}

async fn handle_command(
    inner: &Arc<TransportInner>,
    stream: &mut BufStream<Box<dyn Connection>>,
    kind: u8,
    body: &[u8],
    shutdown_rx: &mut watch::Receiver<bool>,
    epoch_rx: &mut watch::Receiver<u64>,
) -> Result<()> {
    let command = wire::decode_command(kind, body)?;

    // Heartbeat fast path: empty-entry AppendEntries skips the consumer
    // channel when a handler is registered.
    if let RpcCommand::AppendEntries(req) = &command {
        if wire::is_heartbeat(req) {
            let handler = inner.heartbeat.read().clone();
            if let Some(handler) = handler {
                let (responder, rx) = RpcResponder::new();
                handler(RaftRpc {
                    command,
                    reader: None,
                    responder,
                });
                let result = await_response(rx, shutdown_rx, epoch_rx).await?;
                return wire::write_response(stream, &result).await;
            }
        }
    }

    if let RpcCommand::InstallSnapshot(req) = &command {
        let size = req.size;
        return handle_install_snapshot(inner, stream, command, size, epoch_rx).await;
    }

    let (responder, rx) = RpcResponder::new();
    let rpc = RaftRpc {
        command,
        reader: None,
        responder,
    };
    send_to_consumer(inner, rpc, epoch_rx).await?;

    let result = await_response(rx, shutdown_rx, epoch_rx).await?;
    wire::write_response(stream, &result).await
}

/// Hand an envelope to the consumer, giving up if the streams are closed
/// while the bounded channel is full.
async fn send_to_consumer(
    inner: &Arc<TransportInner>,
    rpc: RaftRpc,
    epoch_rx: &mut watch::Receiver<u64>,
) -> Result<()> {
    tokio::select! {
        res = inner.consumer_tx.send(rpc) => {
            res.map_err(|_| RaftNetError::TransportShutdown)
        }
        _ = epoch_rx.changed() => {
            Err(RaftNetError::Protocol("stream layer is closed".to_string()))
        }
    }
}

/// InstallSnapshot delivery: hand the consumer a reader over the trailing
/// `size` body bytes, relay those bytes as the consumer pulls them, and
/// discard whatever it leaves unread so the next frame starts aligned.
async fn handle_install_snapshot(
    inner: &Arc<TransportInner>,
    stream: &mut BufStream<Box<dyn Connection>>,
    command: RpcCommand,
    size: u64,
    epoch_rx: &mut watch::Receiver<u64>,
) -> Result<()> {
    let (pipe_w, pipe_r) = tokio::io::duplex(SNAPSHOT_CHUNK);
    let (responder, mut rx) = RpcResponder::new();

    let rpc = RaftRpc {
        command,
        reader: Some(Box::new(pipe_r)),
        responder,
    };
    send_to_consumer(inner, rpc, epoch_rx).await?;

    let mut remaining = size as usize;
    let mut writer = Some(pipe_w);
    let mut chunk = vec![0u8; SNAPSHOT_CHUNK];

    let result = loop {
        if remaining == 0 {
            // Signal EOF to the consumer's reader and wait for the verdict.
            writer.take();
            break tokio::select! {
                res = &mut rx => res.map_err(dropped_envelope)?,
                _ = epoch_rx.changed() => {
                    return Err(RaftNetError::Protocol("stream layer is closed".to_string()));
                }
            };
        }

        tokio::select! {
            biased;
            res = &mut rx => break res.map_err(dropped_envelope)?,
            _ = epoch_rx.changed() => {
                return Err(RaftNetError::Protocol("stream layer is closed".to_string()));
            }
            read = stream.read(&mut chunk[..SNAPSHOT_CHUNK.min(remaining)]) => {
                let n = read?;
                if n == 0 {
                    return Err(RaftNetError::Protocol(
                        "connection closed before snapshot body completed".to_string(),
                    ));
                }
                remaining -= n;
                if let Some(w) = writer.as_mut() {
                    if w.write_all(&chunk[..n]).await.is_err() {
                        // Consumer dropped its reader; keep consuming from
                        // the socket so framing stays aligned.
                        writer.take();
                    }
                }
            }
        }
    };

    // Drain any unread remainder of the declared body so the next frame
    // starts aligned.
    if remaining > 0 {
        let mut rest = (&mut *stream).take(remaining as u64);
        tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    }

    wire::write_response(stream, &result).await
}

fn dropped_envelope(_: oneshot::error::RecvError) -> RaftNetError {
    RaftNetError::Protocol("rpc envelope dropped without a response".to_string())
}

async fn await_response(
    rx: oneshot::Receiver<RpcResult>,
    shutdown_rx: &mut watch::Receiver<bool>,
    epoch_rx: &mut watch::Receiver<u64>,
) -> Result<RpcResult> {
    tokio::select! {
        res = rx => res.map_err(dropped_envelope),
        _ = shutdown_rx.changed() => Err(RaftNetError::TransportShutdown),
        _ = epoch_rx.changed() => Err(RaftNetError::Protocol(
            "stream layer is closed".to_string(),
        )),
    }
}
