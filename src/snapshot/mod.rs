//! State-machine snapshot storage.
//!
//! Snapshots are opaque byte streams plus metadata describing the log
//! position they cover and the cluster membership at that point. The
//! on-disk store lives in [`file`].

pub mod file;

pub use file::{FileSnapshotSink, FileSnapshotStore};

use crate::error::Result;
use crate::types::{Configuration, LogIndex, ServerAddress, ServerId, ServerSuffrage, Term};
use serde::{Deserialize, Serialize};

/// Snapshot format version.
pub type SnapshotVersion = u64;

/// Oldest snapshot format this store can read.
pub const SNAPSHOT_VERSION_MIN: SnapshotVersion = 1;

/// Newest snapshot format this store can read or write.
pub const SNAPSHOT_VERSION_MAX: SnapshotVersion = 1;

/// Metadata describing one finalized snapshot. Field names are fixed by the
/// on-disk `meta.json` format and must not change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Snapshot format version.
    #[serde(rename = "Version")]
    pub version: SnapshotVersion,
    /// Opaque id usable with `open` after the snapshot is finalized.
    #[serde(rename = "ID")]
    pub id: String,
    /// Last log index covered by the snapshot.
    #[serde(rename = "Index")]
    pub index: LogIndex,
    /// Term of the entry at `index`.
    #[serde(rename = "Term")]
    pub term: Term,
    /// Legacy peers encoding of the voting members.
    #[serde(rename = "Peers", default)]
    pub peers: Vec<u8>,
    /// Cluster membership at `configuration_index`.
    #[serde(rename = "Configuration", default)]
    pub configuration: Configuration,
    /// Log index the membership was committed at.
    #[serde(rename = "ConfigurationIndex", default)]
    pub configuration_index: LogIndex,
    /// Size in bytes of the snapshot body.
    #[serde(rename = "Size")]
    pub size: u64,
}

/// Serializes a peer `(id, address)` pair the way the transport stores it in
/// committed configuration entries. Implemented by the network transport;
/// the store uses it to fill the `Peers` metadata field.
pub trait PeerEncoder {
    fn encode_peer(&self, id: &ServerId, addr: &ServerAddress) -> Result<Vec<u8>>;
}

/// Encoded addresses of all voting servers, as stored in `Peers`.
pub(crate) fn encode_peers(
    configuration: &Configuration,
    encoder: &dyn PeerEncoder,
) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    for server in &configuration.servers {
        if server.suffrage == ServerSuffrage::Voter {
            encoded.push(encoder.encode_peer(&server.id, &server.address)?);
        }
    }
    Ok(rmp_serde::to_vec(&encoded)?)
}
