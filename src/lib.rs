//! raftnet - network transport and file snapshot store for a Raft
//! consensus engine.
//!
//! raftnet moves Raft RPCs (AppendEntries, RequestVote, InstallSnapshot,
//! TimeoutNow) between peers over a length-framed stream protocol, and
//! persists state-machine snapshots to a local directory with atomic
//! install and CRC-verified read-back.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        raftnet                             │
//! ├────────────────────────────────────────────────────────────┤
//! │  Client Path: pooled RPCs | AppendEntries pipeline         │
//! ├────────────────────────────────────────────────────────────┤
//! │  Server Loop: accept + backoff | per-connection handlers   │
//! ├────────────────────────────────────────────────────────────┤
//! │  Wire: kind-tagged, length-prefixed MsgPack frames         │
//! ├────────────────────────────────────────────────────────────┤
//! │  Stream Layer: TCP today, pluggable via trait              │
//! ├────────────────────────────────────────────────────────────┤
//! │  Snapshot Store: tmp-dir staging | CRC64 | retention       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use raftnet::config::NetworkConfig;
//! use raftnet::tcp::TcpStreamLayer;
//! use raftnet::transport::NetworkTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> raftnet::Result<()> {
//!     let stream = TcpStreamLayer::bind("127.0.0.1:7000", None).await?;
//!     let transport = NetworkTransport::new(Arc::new(stream), NetworkConfig::default())?;
//!
//!     // Hand `transport.consumer()` to the consensus engine and start
//!     // issuing RPCs at peers.
//!     let mut rpcs = transport.consumer();
//!     while let Some(rpc) = rpcs.recv().await {
//!         // apply, then rpc.respond(...)
//!         # let _ = rpc;
//!         # break;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod snapshot;
pub mod stream;
pub mod tcp;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use error::{RaftNetError, Result};
pub use snapshot::{FileSnapshotSink, FileSnapshotStore, SnapshotMeta};
pub use transport::{AppendEntriesPipeline, NetworkTransport};
pub use types::{RaftRpc, ServerAddress, ServerId};
