//! Stream layer abstraction.
//!
//! A [`StreamLayer`] is the capability set the transport builds on: accept
//! inbound connections, dial outbound ones, and report the local address.
//! The TCP variant lives in [`crate::tcp`]; tests plug in in-memory or
//! failure-injecting layers through the same trait.

use crate::error::Result;
use crate::types::ServerAddress;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte pipe between two transports. Implemented for any
/// async stream; closed by dropping.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Pluggable listener/dialer pair used by the transport.
#[async_trait::async_trait]
pub trait StreamLayer: Send + Sync + 'static {
    /// Wait for and return the next inbound connection.
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// Open a connection to `addr`, failing after `timeout`.
    async fn dial(&self, addr: &ServerAddress, timeout: Duration) -> Result<Box<dyn Connection>>;

    /// The address peers should use to reach this layer.
    fn local_addr(&self) -> ServerAddress;
}
