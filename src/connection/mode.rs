//! Connection modes: plaintext, TLS handshake, TLS traffic
//!
//! All three expose the same `read`/`write` entry points, so the driver never knows
//! whether encryption is active. The handshake mode drives rustls until the handshake
//! completes, replaces itself with the traffic mode and then performs the read or write
//! that was originally requested.

use super::transport::Transport;
use crate::protocol::Buffer;
use crate::{Error, Result};
use rustls::ClientConnection;
use std::io::{self, Read, Write};

/// Ciphertext read size
const RECORD_CHUNK: usize = 16 * 1024;

/// rustls client session plus ciphertext received but not yet processed, and
/// ciphertext produced but not yet sent
///
/// Every await below only moves bytes between these buffers and the socket, so a read or
/// write dropped at its deadline loses nothing and can simply be issued again.
pub(crate) struct TlsSession {
    conn: ClientConnection,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    scratch: Box<[u8]>,
}

impl TlsSession {
    pub(crate) fn new(conn: ClientConnection) -> Self {
        Self {
            conn,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            scratch: vec![0; RECORD_CHUNK].into_boxed_slice(),
        }
    }

    /// Send every pending TLS record
    async fn flush(&mut self, transport: &mut Transport) -> Result<()> {
        loop {
            if self.outgoing.is_empty() {
                if !self.conn.wants_write() {
                    break;
                }
                self.conn.write_tls(&mut self.outgoing)?;
                continue;
            }
            let n = transport.write(&self.outgoing).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.outgoing.drain(..n);
        }
        transport.flush().await
    }

    /// Hand buffered ciphertext to rustls, or read more from the socket when none is left
    async fn receive(&mut self, transport: &mut Transport) -> Result<()> {
        if self.incoming.is_empty() {
            let n = transport.read(&mut self.scratch).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.incoming.extend_from_slice(&self.scratch[..n]);
        }
        let consumed = self.conn.read_tls(&mut self.incoming.as_slice())?;
        self.incoming.drain(..consumed);
        self.conn.process_new_packets()?;
        Ok(())
    }

    async fn handshake(&mut self, transport: &mut Transport) -> Result<()> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                self.flush(transport).await?;
            } else {
                self.receive(transport).await?;
            }
        }
        // the client's Finished flight
        self.flush(transport).await
    }

    /// Decrypt into `buf`, reading ciphertext until at least one byte is available
    async fn read(&mut self, transport: &mut Transport, buf: &mut Buffer) -> Result<usize> {
        loop {
            match self.conn.reader().read(buf.spare_mut()) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    buf.commit(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(Error::ConnectionClosed)
                }
                Err(e) => return Err(e.into()),
            }
            self.receive(transport).await?;
            if self.conn.wants_write() {
                // key updates and alerts
                self.flush(transport).await?;
            }
        }
    }

    /// Send the records of the previous call, then encrypt as much of `data` as rustls
    /// accepts. The new records go out on the next `write` or `flush`.
    async fn write(&mut self, transport: &mut Transport, data: &[u8]) -> Result<usize> {
        self.flush(transport).await?;
        Ok(self.conn.writer().write(data)?)
    }
}

/// How bytes cross the transport
pub(crate) enum Mode {
    /// No encryption
    Plain,
    /// TLS handshake in progress
    Handshake(Box<TlsSession>),
    /// TLS established
    Traffic(Box<TlsSession>),
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Plain => "Plain",
            Mode::Handshake(_) => "Handshake",
            Mode::Traffic(_) => "Traffic",
        })
    }
}

impl Mode {
    /// Handshake mode for a fresh rustls client session
    pub(crate) fn handshake(conn: ClientConnection) -> Self {
        Mode::Handshake(Box::new(TlsSession::new(conn)))
    }

    /// Whether the connection is encrypted (or about to be)
    pub(crate) fn is_tls(&self) -> bool {
        !matches!(self, Mode::Plain)
    }

    async fn finish_handshake(&mut self, transport: &mut Transport) -> Result<()> {
        let Mode::Handshake(tls) = self else {
            return Ok(());
        };
        tls.handshake(transport).await?;
        tracing::info!(
            version = ?tls.conn.protocol_version(),
            cipher = ?tls.conn.negotiated_cipher_suite().map(|s| s.suite()),
            "TLS established"
        );
        crate::metrics::counters::tls_established();
        if let Mode::Handshake(tls) = std::mem::replace(self, Mode::Plain) {
            *self = Mode::Traffic(tls);
        }
        Ok(())
    }

    /// Read into the spare capacity of `buf`. Returns the number of plaintext bytes
    /// added; end of stream is [`Error::ConnectionClosed`].
    pub(crate) async fn read(&mut self, transport: &mut Transport, buf: &mut Buffer) -> Result<usize> {
        self.finish_handshake(transport).await?;
        match self {
            Mode::Plain => {
                let n = transport.read(buf.spare_mut()).await?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
                buf.commit(n);
                Ok(n)
            }
            Mode::Traffic(tls) => tls.read(transport, buf).await,
            Mode::Handshake(_) => Err(Error::InvalidState {
                expected: "handshake complete".into(),
                actual: "handshaking".into(),
            }),
        }
    }

    /// Write some of `data`, returning how many plaintext bytes were taken. Taken bytes
    /// may still be queued; [`flush`](Self::flush) sends them.
    pub(crate) async fn write(&mut self, transport: &mut Transport, data: &[u8]) -> Result<usize> {
        self.finish_handshake(transport).await?;
        match self {
            Mode::Plain => transport.write(data).await,
            Mode::Traffic(tls) => tls.write(transport, data).await,
            Mode::Handshake(_) => Err(Error::InvalidState {
                expected: "handshake complete".into(),
                actual: "handshaking".into(),
            }),
        }
    }

    /// Send everything taken by [`write`](Self::write)
    pub(crate) async fn flush(&mut self, transport: &mut Transport) -> Result<()> {
        match self {
            Mode::Plain => transport.flush().await,
            Mode::Handshake(tls) | Mode::Traffic(tls) => tls.flush(transport).await,
        }
    }

    /// Best-effort close_notify, then close the socket
    pub(crate) async fn shutdown(&mut self, transport: &mut Transport) {
        if let Mode::Traffic(tls) = self {
            tls.conn.send_close_notify();
            let _ = tls.flush(transport).await;
        }
        let _ = transport.shutdown().await;
    }
}
