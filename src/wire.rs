//! Wire codec for the stream protocol.
//!
//! Every message starts with a one-byte RPC kind tag followed by a
//! length-prefixed MsgPack body. Responses carry a length-prefixed error
//! string (empty on success) before the body. InstallSnapshot request frames
//! are trailed by the declared number of raw snapshot bytes, which are not
//! part of the framed body.
//!
//! Bodies are encoded with field names on the wire (`to_vec_named`) so that
//! peers running adjacent protocol versions can skip fields they do not
//! know, and absent fields decode to their defaults.

use crate::error::{RaftNetError, Result};
use crate::types::{
    AppendEntriesRequest, RpcCommand, RpcResponse, ServerAddress,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// RPC kind tags. Stable on the wire.
pub const RPC_APPEND_ENTRIES: u8 = 0;
pub const RPC_REQUEST_VOTE: u8 = 1;
pub const RPC_INSTALL_SNAPSHOT: u8 = 2;
pub const RPC_TIMEOUT_NOW: u8 = 3;

/// Upper bound on a framed body. Larger frames are a protocol error and the
/// connection is abandoned. Snapshot bodies stream outside the frame and are
/// not subject to this cap.
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

/// Encode a body to MsgPack with named fields.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(body)?)
}

/// Decode a MsgPack body.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

async fn write_chunk<W: AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<()> {
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(bytes).await?;
    Ok(())
}

async fn read_chunk<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME_BODY {
        return Err(RaftNetError::Protocol(format!(
            "frame body of {} bytes exceeds cap of {}",
            len, MAX_FRAME_BODY
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one request frame: kind tag, then the length-prefixed body.
/// The caller is responsible for flushing and for streaming any trailing
/// snapshot bytes.
pub async fn write_request<W, T>(w: &mut W, kind: u8, body: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_body(body)?;
    w.write_u8(kind).await?;
    write_chunk(w, &encoded).await?;
    Ok(())
}

/// Read one request frame and return its kind tag and raw body bytes.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u8, Vec<u8>)> {
    let kind = r.read_u8().await?;
    let body = read_chunk(r).await?;
    Ok((kind, body))
}

/// Decode a raw request body into the matching command variant.
pub fn decode_command(kind: u8, body: &[u8]) -> Result<RpcCommand> {
    match kind {
        RPC_APPEND_ENTRIES => Ok(RpcCommand::AppendEntries(decode_body(body)?)),
        RPC_REQUEST_VOTE => Ok(RpcCommand::RequestVote(decode_body(body)?)),
        RPC_INSTALL_SNAPSHOT => Ok(RpcCommand::InstallSnapshot(decode_body(body)?)),
        RPC_TIMEOUT_NOW => Ok(RpcCommand::TimeoutNow(decode_body(body)?)),
        other => Err(RaftNetError::UnknownRpcKind(other)),
    }
}

/// Write one response frame: length-prefixed error string (empty on
/// success) followed by the length-prefixed body.
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    result: &std::result::Result<RpcResponse, String>,
) -> Result<()> {
    match result {
        Ok(resp) => {
            write_chunk(w, &[]).await?;
            let encoded = match resp {
                RpcResponse::AppendEntries(body) => encode_body(body)?,
                RpcResponse::RequestVote(body) => encode_body(body)?,
                RpcResponse::InstallSnapshot(body) => encode_body(body)?,
                RpcResponse::TimeoutNow(body) => encode_body(body)?,
            };
            write_chunk(w, &encoded).await?;
        }
        Err(msg) => {
            write_chunk(w, msg.as_bytes()).await?;
            write_chunk(w, &[]).await?;
        }
    }
    Ok(())
}

/// Read one response frame. A non-empty error string becomes
/// [`RaftNetError::Remote`] and the body is discarded undecoded.
pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let err = read_chunk(r).await?;
    let body = read_chunk(r).await?;
    if !err.is_empty() {
        let msg = String::from_utf8_lossy(&err).into_owned();
        return Err(RaftNetError::Remote(msg));
    }
    Ok(body)
}

/// Serialize a peer address to the form stored in committed configuration
/// entries.
pub fn encode_peer(addr: &ServerAddress) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(&addr.0)?)
}

/// Inverse of [`encode_peer`].
pub fn decode_peer(bytes: &[u8]) -> Result<ServerAddress> {
    let addr: String = rmp_serde::from_slice(bytes)?;
    Ok(ServerAddress(addr))
}

/// Heartbeat predicate for the fast path: a non-zero term with no entries
/// and every positional field unused. Replication and probe requests always
/// carry a prev entry, a commit index, or entries, so they never match.
pub fn is_heartbeat(req: &AppendEntriesRequest) -> bool {
    req.term != 0
        && req.prev_log_entry == 0
        && req.prev_log_term == 0
        && req.entries.is_empty()
        && req.leader_commit_index == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppendEntriesResponse, LogEntry, LogKind, RpcHeader};

    fn sample_append() -> AppendEntriesRequest {
        AppendEntriesRequest {
            header: RpcHeader {
                protocol_version: 3,
                addr: b"cartman".to_vec(),
            },
            term: 10,
            prev_log_entry: 100,
            prev_log_term: 4,
            entries: vec![LogEntry {
                index: 101,
                term: 4,
                kind: LogKind::Noop,
                data: Vec::new(),
            }],
            leader_commit_index: 90,
        }
    }

    #[tokio::test]
    async fn test_request_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let args = sample_append();
        write_request(&mut client, RPC_APPEND_ENTRIES, &args)
            .await
            .unwrap();

        let (kind, body) = read_request(&mut server).await.unwrap();
        assert_eq!(kind, RPC_APPEND_ENTRIES);
        match decode_command(kind, &body).unwrap() {
            RpcCommand::AppendEntries(decoded) => assert_eq!(decoded, args),
            other => panic!("wrong command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_error_string() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_response(&mut server, &Err("no leader".to_string()))
            .await
            .unwrap();

        let err = read_response(&mut client).await.unwrap_err();
        match err {
            RaftNetError::Remote(msg) => assert_eq!(msg, "no leader"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_ok_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let resp = AppendEntriesResponse {
            term: 4,
            last_log: 90,
            success: true,
            ..Default::default()
        };
        write_response(&mut server, &Ok(RpcResponse::AppendEntries(resp.clone())))
            .await
            .unwrap();

        let body = read_response(&mut client).await.unwrap();
        let decoded: AppendEntriesResponse = decode_body(&body).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_unknown_kind() {
        let err = decode_command(9, &[]).unwrap_err();
        assert!(matches!(err, RaftNetError::UnknownRpcKind(9)));
    }

    #[test]
    fn test_peer_round_trip() {
        let addr = ServerAddress::from("127.0.0.1:7000");
        let encoded = encode_peer(&addr).unwrap();
        assert_eq!(decode_peer(&encoded).unwrap(), addr);
    }

    #[test]
    fn test_heartbeat_predicate() {
        let mut req = AppendEntriesRequest {
            term: 10,
            ..Default::default()
        };
        assert!(is_heartbeat(&req));

        req.entries.push(LogEntry {
            index: 1,
            term: 1,
            kind: LogKind::Command,
            data: vec![1],
        });
        assert!(!is_heartbeat(&req));

        let replicate = sample_append();
        assert!(!is_heartbeat(&replicate));
    }
}
