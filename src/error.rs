//! Error types for raftnet.
//!
//! This module provides a unified error type [`RaftNetError`] for all
//! transport and snapshot-store operations, along with a convenient
//! [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Local I/O**: dial failures, read/write failures, unexpected EOF.
//!   The affected connection is closed and never returned to the pool.
//! - **Remote**: the peer answered with a non-empty error string. The
//!   connection stays reusable.
//! - **Protocol**: unknown frame kind, decode failure, oversized body.
//!   The connection is unrecoverable and closed.
//! - **Shutdown**: operations after close return a sentinel.
//! - **Snapshot integrity**: CRC mismatch or malformed metadata; the
//!   snapshot is left on disk for inspection.

use std::io;
use thiserror::Error;

/// Main error type for raftnet operations.
#[derive(Error, Debug)]
pub enum RaftNetError {
    // Transport lifecycle
    #[error("transport already shutdown")]
    TransportShutdown,

    #[error("pipeline closed")]
    PipelineShutdown,

    #[error("pipeline replication not supported, increase max in-flight RPCs")]
    PipelineReplicationNotSupported,

    // Stream layer construction
    #[error("local bind address is not advertisable")]
    NotAdvertisable,

    #[error("local address is not a TCP address")]
    NotTcp,

    // Wire protocol
    #[error("remote error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown rpc kind {0}")]
    UnknownRpcKind(u8),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    // Snapshot store
    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("unsupported snapshot version {0}")]
    UnsupportedSnapshotVersion(u64),

    #[error("must retain at least one snapshot")]
    InvalidRetainCount,

    #[error("snapshot path not accessible: {0}")]
    SnapshotPathNotAccessible(String),

    #[error("permissions test failed: {0}")]
    PermissionsTestFailed(String),

    // Configuration
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    // External
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RaftNetError {
    /// Check whether the error came from the peer rather than this host.
    /// Remote errors leave the underlying connection reusable; every other
    /// failure closes it.
    pub fn is_remote(&self) -> bool {
        matches!(self, RaftNetError::Remote(_))
    }

    /// Check if the operation may be retried on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaftNetError::Io(_) | RaftNetError::Timeout(_))
    }
}

impl From<rmp_serde::encode::Error> for RaftNetError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RaftNetError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RaftNetError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RaftNetError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for RaftNetError {
    fn from(e: serde_json::Error) -> Self {
        RaftNetError::Decode(e.to_string())
    }
}

/// Result type alias for raftnet operations.
pub type Result<T> = std::result::Result<T, RaftNetError>;
