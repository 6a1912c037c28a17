//! Socket abstraction (TCP, Unix socket, or any in-memory stream)
//!
//! The transport only moves bytes. Encryption is layered on top by the connection's
//! [`Mode`](super::mode::Mode), so the same transport carries plaintext before the TLS
//! handshake and ciphertext after it.

use crate::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Anything the driver can run the protocol over
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Transport layer
pub enum Transport {
    /// TCP socket
    Tcp(TcpStream),
    /// Unix domain socket
    #[cfg(unix)]
    Unix(UnixStream),
    /// Caller-supplied stream (tests, proxies, tunnels)
    Stream(Box<dyn Socket>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp(stream) => match stream.peer_addr() {
                Ok(addr) => write!(f, "Transport::Tcp({addr})"),
                Err(_) => f.write_str("Transport::Tcp"),
            },
            #[cfg(unix)]
            Transport::Unix(_) => f.write_str("Transport::Unix"),
            Transport::Stream(_) => f.write_str("Transport::Stream"),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $stream:ident => $body:expr) => {
        match $self {
            Transport::Tcp($stream) => $body,
            #[cfg(unix)]
            Transport::Unix($stream) => $body,
            Transport::Stream($stream) => $body,
        }
    };
}

impl Transport {
    /// Connect via TCP, optionally bounded by `timeout`
    pub async fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let connect = TcpStream::connect((host, port));
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| Error::Timeout)??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        Ok(Transport::Tcp(stream))
    }

    /// Connect via Unix socket
    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Transport::Unix(stream))
    }

    /// Wrap an arbitrary stream
    pub fn from_stream(stream: impl Socket) -> Self {
        Transport::Stream(Box::new(stream))
    }

    /// Read whatever is available into `buf`; 0 means end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(dispatch!(self, s => s.read(buf).await?))
    }

    /// Write some of `buf`, returning how much was accepted
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(dispatch!(self, s => s.write(buf).await?))
    }

    /// Write all of `buf`
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        dispatch!(self, s => s.write_all(buf).await?);
        Ok(())
    }

    /// Flush the transport
    pub async fn flush(&mut self) -> Result<()> {
        dispatch!(self, s => s.flush().await?);
        Ok(())
    }

    /// Shutdown the transport
    pub async fn shutdown(&mut self) -> Result<()> {
        dispatch!(self, s => s.shutdown().await?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_connect_failure() {
        let result = Transport::connect_tcp("127.0.0.1", 1, Some(Duration::from_secs(2))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stream_transport_moves_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut transport = Transport::from_stream(client);
        transport.write_all(b"ping").await.unwrap();

        let mut got = [0u8; 4];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        server.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        drop(server);
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
    }
}
