//! Core type definitions for the raftnet transport.
//!
//! This module contains the identifiers, RPC message structs, and the RPC
//! envelope delivered to the transport consumer.
//!
//! # Key Types
//!
//! - [`ServerId`] / [`ServerAddress`]: opaque peer identity and dial string
//! - [`RpcCommand`] / [`RpcResponse`]: the four Raft RPCs and their replies
//! - [`RaftRpc`]: envelope handed to the consumer channel, carrying the
//!   decoded command, an optional snapshot body reader, and a single-shot
//!   responder
//! - [`AddressProvider`]: optional hook translating a server id into the
//!   address that should actually be dialed
//!
//! # Type Aliases
//!
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: Raft log position
//! - [`ProtocolVersion`] = `u64`: wire protocol version carried in headers

use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Wire protocol version carried in every RPC header.
pub type ProtocolVersion = u64;

/// Oldest protocol version this transport can speak.
pub const PROTOCOL_VERSION_MIN: ProtocolVersion = 0;

/// Newest protocol version this transport can speak.
pub const PROTOCOL_VERSION_MAX: ProtocolVersion = 3;

/// Unique identifier for a server in the cluster. Opaque and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a server, in a form the stream layer can dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress(pub String);

impl ServerAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Translates a server id into the address that should be dialed, enabling
/// address rewrites without changing committed cluster configuration.
pub trait AddressProvider: Send + Sync {
    fn server_addr(&self, id: &ServerId) -> Result<ServerAddress>;
}

/// Degree of participation a server has in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerSuffrage {
    /// Full participant: votes in elections and counts toward quorum.
    Voter,
    /// Receives log entries but has no vote.
    Nonvoter,
    /// Receives log entries and will be promoted once caught up.
    Staging,
}

/// One server in a committed membership configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub suffrage: ServerSuffrage,
    pub id: ServerId,
    pub address: ServerAddress,
}

/// Committed cluster membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

/// Log entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    /// Applied to the user state machine.
    Command,
    /// Used to assert leadership.
    Noop,
    /// Used to quiesce the cluster before a barrier.
    Barrier,
    /// Membership change entry.
    Configuration,
}

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position of the entry in the log.
    pub index: LogIndex,
    /// Term in which the entry was created.
    pub term: Term,
    /// Entry kind.
    pub kind: LogKind,
    /// Opaque payload.
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Common header carried by every RPC request and response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcHeader {
    /// Protocol version of the sender.
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Advertised address of the sender. Informational.
    #[serde(default)]
    pub addr: Vec<u8>,
}

/// AppendEntries RPC arguments: log replication and heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    #[serde(default)]
    pub header: RpcHeader,
    /// Leader's term.
    pub term: Term,
    /// Index of the log entry immediately preceding the new ones.
    #[serde(default)]
    pub prev_log_entry: LogIndex,
    /// Term of the entry at `prev_log_entry`.
    #[serde(default)]
    pub prev_log_term: Term,
    /// Entries to replicate. Empty for heartbeats.
    #[serde(default)]
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    #[serde(default)]
    pub leader_commit_index: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    #[serde(default)]
    pub header: RpcHeader,
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// Hint of the follower's last log index for faster convergence.
    #[serde(default)]
    pub last_log: LogIndex,
    /// Whether the follower accepted the entries.
    pub success: bool,
    /// Set when the follower rejected for a reason that retrying with an
    /// earlier prev index cannot fix.
    #[serde(default)]
    pub no_retry_backoff: bool,
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    #[serde(default)]
    pub header: RpcHeader,
    /// Candidate's term.
    pub term: Term,
    /// Index of the candidate's last log entry.
    #[serde(default)]
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    #[serde(default)]
    pub last_log_term: Term,
    /// Set when the vote was triggered by a leadership transfer; tells the
    /// receiver to grant even if it recently heard from a leader.
    #[serde(default)]
    pub leadership_transfer: bool,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    #[serde(default)]
    pub header: RpcHeader,
    /// Current term, for the candidate to update itself.
    pub term: Term,
    /// Whether the vote was granted.
    pub granted: bool,
}

/// InstallSnapshot RPC arguments. The framed request is followed on the wire
/// by exactly `size` raw bytes of snapshot body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    #[serde(default)]
    pub header: RpcHeader,
    /// Snapshot format version.
    #[serde(default)]
    pub snapshot_version: u64,
    /// Leader's term.
    pub term: Term,
    /// The snapshot replaces all entries up through this index.
    pub last_log_index: LogIndex,
    /// Term of `last_log_index`.
    pub last_log_term: Term,
    /// Peer set encoded with the transport's peer codec.
    #[serde(default)]
    pub peers: Vec<u8>,
    /// Cluster membership configuration at `configuration_index`.
    #[serde(default)]
    pub configuration: Vec<u8>,
    /// Log index of the included configuration.
    #[serde(default)]
    pub configuration_index: LogIndex,
    /// Length in bytes of the snapshot body that follows the frame.
    pub size: u64,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    #[serde(default)]
    pub header: RpcHeader,
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// Whether the snapshot was accepted.
    pub success: bool,
}

/// TimeoutNow RPC arguments: instructs the target to start an election now.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    #[serde(default)]
    pub header: RpcHeader,
}

/// TimeoutNow RPC response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    #[serde(default)]
    pub header: RpcHeader,
}

/// A decoded inbound RPC request.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCommand {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
    TimeoutNow(TimeoutNowRequest),
}

/// An outbound RPC response.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    TimeoutNow(TimeoutNowResponse),
}

/// Reader over the raw snapshot body that trails an InstallSnapshot frame.
pub type SnapshotBody = Box<dyn AsyncRead + Send + Unpin>;

/// Outcome handed back through an [`RpcResponder`]: the response to encode,
/// or an error string surfaced to the remote caller.
pub type RpcResult = std::result::Result<RpcResponse, String>;

/// Single-shot response handle for an inbound RPC. The first call to
/// [`respond`](RpcResponder::respond) wins; later calls are ignored.
pub struct RpcResponder {
    tx: Mutex<Option<oneshot::Sender<RpcResult>>>,
}

impl RpcResponder {
    pub(crate) fn new() -> (Self, oneshot::Receiver<RpcResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver the response for this RPC. Consumers must call this exactly
    /// once per envelope; a never-answered envelope parks its connection
    /// handler until the peer gives up.
    pub fn respond(&self, result: RpcResult) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for RpcResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcResponder").finish_non_exhaustive()
    }
}

/// Envelope delivered on the transport's consumer channel.
pub struct RaftRpc {
    /// The decoded request.
    pub command: RpcCommand,
    /// Trailing snapshot body. Present only for InstallSnapshot; must be
    /// fully drained before responding.
    pub reader: Option<SnapshotBody>,
    /// Single-shot response handle.
    pub responder: RpcResponder,
}

impl RaftRpc {
    /// Respond to this RPC. Shorthand for `self.responder.respond(...)`.
    pub fn respond(&self, result: RpcResult) {
        self.responder.respond(result);
    }
}

impl std::fmt::Debug for RaftRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftRpc")
            .field("command", &self.command)
            .field("has_reader", &self.reader.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_display() {
        let id = ServerId::from("node-1");
        assert_eq!(id.to_string(), "node-1");
        assert_eq!(id.as_str(), "node-1");
    }

    #[tokio::test]
    async fn test_responder_single_shot() {
        let (responder, rx) = RpcResponder::new();

        responder.respond(Ok(RpcResponse::TimeoutNow(TimeoutNowResponse::default())));
        // Second call is ignored rather than panicking or overwriting.
        responder.respond(Err("too late".to_string()));

        let got = rx.await.unwrap();
        assert!(matches!(got, Ok(RpcResponse::TimeoutNow(_))));
    }
}
