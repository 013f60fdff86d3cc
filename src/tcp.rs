//! TCP stream layer.

use crate::error::{RaftNetError, Result};
use crate::stream::{Connection, StreamLayer};
use crate::types::ServerAddress;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// [`StreamLayer`] over plain TCP.
#[derive(Debug)]
pub struct TcpStreamLayer {
    listener: TcpListener,
    advertise: Option<SocketAddr>,
}

impl TcpStreamLayer {
    /// Bind a listener on `bind_addr`. When `advertise` is given it is the
    /// address reported by [`StreamLayer::local_addr`]; it must parse as a
    /// socket address and must not be unspecified, or construction fails.
    pub async fn bind(bind_addr: &str, advertise: Option<&str>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;

        let advertise = match advertise {
            Some(raw) => Some(raw.parse::<SocketAddr>().map_err(|_| RaftNetError::NotTcp)?),
            None => None,
        };

        let layer = Self {
            listener,
            advertise,
        };

        if layer.socket_addr()?.ip().is_unspecified() {
            return Err(RaftNetError::NotAdvertisable);
        }

        debug!(addr = %layer.local_addr(), "tcp stream layer bound");
        Ok(layer)
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        match self.advertise {
            Some(addr) => Ok(addr),
            None => Ok(self.listener.local_addr()?),
        }
    }
}

#[async_trait::async_trait]
impl StreamLayer for TcpStreamLayer {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }

    async fn dial(&self, addr: &ServerAddress, timeout: Duration) -> Result<Box<dyn Connection>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| RaftNetError::Timeout(timeout.as_millis() as u64))??;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> ServerAddress {
        match self.socket_addr() {
            Ok(addr) => ServerAddress(addr.to_string()),
            // The listener address was valid at bind time; losing it later
            // means the socket is gone and callers will fail on dial anyway.
            Err(_) => ServerAddress(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_and_dial() {
        let server = TcpStreamLayer::bind("127.0.0.1:0", None).await.unwrap();
        let addr = server.local_addr();

        let client = TcpStreamLayer::bind("127.0.0.1:0", None).await.unwrap();

        let accept = tokio::spawn(async move { server.accept().await });
        let mut conn = client
            .dial(&addr, Duration::from_secs(1))
            .await
            .unwrap();

        let mut inbound = accept.await.unwrap().unwrap();
        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();

        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_unspecified_bind_is_not_advertisable() {
        let err = TcpStreamLayer::bind("0.0.0.0:0", None).await.unwrap_err();
        assert!(matches!(err, RaftNetError::NotAdvertisable));
    }

    #[tokio::test]
    async fn test_advertise_overrides_local_addr() {
        let layer = TcpStreamLayer::bind("127.0.0.1:0", Some("127.0.0.1:7654"))
            .await
            .unwrap();
        assert_eq!(layer.local_addr(), ServerAddress::from("127.0.0.1:7654"));
    }

    #[tokio::test]
    async fn test_bad_advertise_is_not_tcp() {
        let err = TcpStreamLayer::bind("127.0.0.1:0", Some("not-an-address"))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftNetError::NotTcp));
    }

    #[tokio::test]
    async fn test_unspecified_advertise_is_not_advertisable() {
        let err = TcpStreamLayer::bind("127.0.0.1:0", Some("0.0.0.0:7654"))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftNetError::NotAdvertisable));
    }
}
