//! Pipelined AppendEntries replication.
//!
//! A pipeline holds one dedicated connection to a peer. The caller enqueues
//! requests with [`AppendEntriesPipeline::append_entries`]; a spawned
//! receiver task matches framed responses to requests in FIFO order and
//! emits the outcome on the pipeline's consumer channel.
//!
//! Flow control is the in-flight channel itself: enqueueing writes the frame
//! to the socket first and then pushes a marker, so once `max_in_flight - 1`
//! requests are unanswered the next enqueue blocks on the channel.
//!
//! Lifecycle: Open, then Draining once close is requested or the connection
//! fails (new sends are refused, pending futures still complete), then
//! Closed when the receiver exits.

use crate::error::{RaftNetError, Result};
use crate::stream::Connection;
use crate::types::{AppendEntriesRequest, AppendEntriesResponse, ProtocolVersion};
use crate::wire;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::debug;

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

type PipelineStream = BufStream<Box<dyn Connection>>;

/// Outcome of one pipelined request, emitted in send order.
pub type PipelineResult = Result<AppendEntriesResponse>;

/// Marker for a request that has been written but not yet answered.
struct InFlight {
    start: Instant,
}

/// Long-lived AppendEntries connection with an independent response reader.
pub struct AppendEntriesPipeline {
    writer: tokio::sync::Mutex<Option<WriteHalf<PipelineStream>>>,
    inflight_tx: mpsc::Sender<InFlight>,
    done_rx: parking_lot::Mutex<Option<mpsc::Receiver<PipelineResult>>>,
    state: Arc<AtomicU8>,
    close_tx: watch::Sender<bool>,
    protocol_version: ProtocolVersion,
}

impl std::fmt::Debug for AppendEntriesPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendEntriesPipeline")
            .field("state", &self.state)
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

impl AppendEntriesPipeline {
    pub(crate) fn start(
        stream: PipelineStream,
        max_in_flight: usize,
        protocol_version: ProtocolVersion,
    ) -> Self {
        // One request can always sit with the receiver, so the channel holds
        // the other max_in_flight - 1. Callers guarantee max_in_flight >= 2.
        let capacity = max_in_flight - 1;
        let (inflight_tx, inflight_rx) = mpsc::channel(capacity);
        let (done_tx, done_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(STATE_OPEN));

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(receive_responses(
            reader,
            inflight_rx,
            done_tx,
            state.clone(),
            close_rx,
        ));

        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            inflight_tx,
            done_rx: parking_lot::Mutex::new(Some(done_rx)),
            state,
            close_tx,
            protocol_version,
        }
    }

    /// Enqueue one request. Writes the frame to the socket, then registers
    /// it with the receiver; blocks when `max_in_flight` requests are
    /// already unanswered.
    pub async fn append_entries(&self, req: &AppendEntriesRequest) -> Result<()> {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(RaftNetError::PipelineShutdown);
        }

        let mut req = req.clone();
        req.header.protocol_version = self.protocol_version;

        {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(RaftNetError::PipelineShutdown)?;
            wire::write_request(writer, wire::RPC_APPEND_ENTRIES, &req).await?;
            writer.flush().await?;
        }

        self.inflight_tx
            .send(InFlight {
                start: Instant::now(),
            })
            .await
            .map_err(|_| RaftNetError::PipelineShutdown)?;
        Ok(())
    }

    /// Take the consumer end of the response channel. May be called once.
    ///
    /// # Panics
    ///
    /// Panics if the consumer has already been taken.
    pub fn consumer(&self) -> mpsc::Receiver<PipelineResult> {
        self.done_rx
            .lock()
            .take()
            .expect("pipeline consumer already taken")
    }

    /// Close the pipeline. New sends fail immediately; requests already in
    /// flight resolve with a stream-closed error. Idempotent.
    pub async fn close(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_DRAINING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.close_tx.send(true);
        // Dropping the write half shuts down our side of the connection.
        self.writer.lock().await.take();
    }
}

async fn receive_responses(
    mut reader: ReadHalf<PipelineStream>,
    mut inflight_rx: mpsc::Receiver<InFlight>,
    done_tx: mpsc::Sender<PipelineResult>,
    state: Arc<AtomicU8>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let outcome = tokio::select! {
            _ = close_rx.changed() => Err(RaftNetError::PipelineShutdown),
            res = read_one(&mut reader) => res,
        };

        match outcome {
            Ok(resp) => {
                let Some(inflight) = inflight_rx.recv().await else {
                    // Pipeline dropped; nothing left to complete.
                    break;
                };
                debug!(elapsed_ms = inflight.start.elapsed().as_millis() as u64, "pipeline response");
                if done_tx.send(Ok(resp)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                state.store(STATE_DRAINING, Ordering::SeqCst);
                // Refuse new markers, then fail every queued one. Senders
                // blocked on a full channel are released with an error.
                inflight_rx.close();
                let mut first = Some(err);
                while inflight_rx.recv().await.is_some() {
                    let e = first.take().unwrap_or(RaftNetError::PipelineShutdown);
                    if done_tx.send(Err(e)).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    state.store(STATE_CLOSED, Ordering::SeqCst);
}

async fn read_one(reader: &mut ReadHalf<PipelineStream>) -> Result<AppendEntriesResponse> {
    let body = wire::read_response(reader).await?;
    wire::decode_body(&body)
}
