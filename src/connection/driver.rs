//! Connection driver
//!
//! A [`Connection`] owns one socket, both buffers, the session state and the current
//! [`Mode`]. [`Connection::run`] drives an [`Operation`] through the decide loop:
//!
//! * `Start`: clear both buffers and call `on_start` again
//! * `Read { needs }`: make room for `needs` bytes, read once, call `on_read`, compact
//! * `Write`: transmit the whole write buffer (draining deferred output), call `on_write`
//! * `Finished`: the connection is healthy and idle again
//! * `Terminate`: close the socket
//!
//! Each read and write is bounded by the operation's timeout. An elapsed deadline goes to
//! `on_timeout`; every other error, including an `Err` returned by a callback, goes to
//! `on_fail` and closes the socket.

use super::config::SessionConfig;
use super::mode::Mode;
use super::state::ConnectionState;
use super::tls::{parse_server_name, SslMode};
use super::transport::Transport;
use crate::metrics::{counters, histograms, labels};
use crate::operation::{
    Batch, BackendKey, Exchange, Next, OobHandler, OobHandlers, Operation, PreparedQuery,
    QueryResult, Session, SimpleQuery, SslProbe, StatementCache, Startup, Terminate,
};
use crate::pool::{ConnectionPool, Detached, Lease};
use crate::protocol::{encode_message, Buffer, Encoder, FrontendMessage, TypeRegistry, Value};
use crate::{Error, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::Instrument;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// How an operation left the decide loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation finished; the connection is reusable
    Finished,
    /// The operation asked for the socket to be closed
    Terminated,
    /// Hard failure; the socket is closed
    Failed,
}

impl Outcome {
    /// Whether the connection can serve another operation
    pub fn is_healthy(self) -> bool {
        self == Outcome::Finished
    }

    fn label(self) -> &'static str {
        match self {
            Outcome::Finished => labels::OUTCOME_FINISHED,
            Outcome::Terminated => labels::OUTCOME_TERMINATED,
            Outcome::Failed => labels::OUTCOME_FAILED,
        }
    }
}

macro_rules! exchange {
    ($conn:ident, $oob:expr) => {
        Exchange {
            read: &mut $conn.read,
            write: &mut $conn.write,
            session: &mut $conn.session,
            statements: &mut $conn.statements,
            oob: $oob,
            types: &*$conn.types,
        }
    };
}

/// Run `fut` under an optional deadline; `None` means the deadline elapsed
async fn within<T>(limit: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Option<Result<T>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// One physical connection
pub struct Connection {
    id: u64,
    transport: Transport,
    mode: Mode,
    state: ConnectionState,
    read: Buffer,
    write: Encoder,
    session: Session,
    statements: StatementCache,
    oob: OobHandlers,
    types: Arc<TypeRegistry>,
    pool: Arc<dyn ConnectionPool>,
    lease: Option<Lease>,
    timeout: Option<Duration>,
    cancel_target: Option<CancelTarget>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("statements", &self.statements.len())
            .field("pooled", &self.lease.is_some())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a transport. Nothing is sent; use [`establish`](Self::establish) for the
    /// full TLS probe and startup sequence.
    pub fn new(transport: Transport, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            mode: Mode::Plain,
            state: ConnectionState::Initial,
            read: Buffer::with_capacity(buffer_size, labels::BUFFER_READ)?,
            write: Encoder::with_capacity(buffer_size)?,
            session: Session::default(),
            statements: StatementCache::default(),
            oob: OobHandlers::new(),
            types: Arc::new(TypeRegistry::new()),
            pool: Arc::new(Detached),
            lease: None,
            timeout: None,
            cancel_target: None,
        })
    }

    /// Open a socket for `config` (TCP, or Unix when `host` is a directory) and establish
    /// the session on it
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        if let Some(path) = config.unix_socket() {
            return Self::connect_local(config, path).await;
        }
        let transport =
            Transport::connect_tcp(&config.host, config.port, config.connect_timeout).await?;
        let mut conn = Self::establish(config, transport).await?;
        conn.cancel_target = Some(CancelTarget::Tcp {
            host: config.host.clone(),
            port: config.port,
        });
        Ok(conn)
    }

    #[cfg(unix)]
    async fn connect_local(config: &SessionConfig, path: PathBuf) -> Result<Self> {
        let transport = Transport::connect_unix(&path).await?;
        // the server never offers TLS on local sockets
        let mut conn = Self::establish_with(config, transport, false).await?;
        conn.cancel_target = Some(CancelTarget::Unix(path));
        Ok(conn)
    }

    #[cfg(not(unix))]
    async fn connect_local(_config: &SessionConfig, path: PathBuf) -> Result<Self> {
        Err(Error::Config(format!(
            "unix sockets are not supported on this platform: {}",
            path.display()
        )))
    }

    /// Probe for TLS (unless disabled), install the handshake mode if accepted, then run
    /// startup and authentication over `transport`
    pub async fn establish(config: &SessionConfig, transport: Transport) -> Result<Self> {
        let probe = config.sslmode != SslMode::Disable;
        Self::establish_with(config, transport, probe).await
    }

    async fn establish_with(config: &SessionConfig, transport: Transport, probe: bool) -> Result<Self> {
        let mut conn = Self::new(transport, config.buffer_size)?;
        conn.timeout = config.operation_timeout;
        let span = tracing::info_span!(
            "establish",
            conn = conn.id,
            user = %config.user,
            sslmode = %config.sslmode
        );
        match conn.start_session(config, probe).instrument(span).await {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.shutdown().await;
                Err(err)
            }
        }
    }

    async fn start_session(&mut self, config: &SessionConfig, probe: bool) -> Result<()> {
        if probe {
            self.state.transition(ConnectionState::NegotiatingTls)?;
            let (op, rx) = SslProbe::new(config.operation_timeout);
            if self.call(op, rx).await? {
                let tls = config.tls_config()?;
                let server_name = parse_server_name(&config.host)?;
                let session = rustls::ClientConnection::new(tls.client_config(), server_name)?;
                tracing::debug!("server accepted TLS");
                self.mode = Mode::handshake(session);
            } else if config.sslmode.requires_tls() {
                return Err(Error::TlsRejected);
            } else {
                tracing::debug!("server declined TLS, continuing in plaintext");
            }
        }

        self.state.transition(ConnectionState::Authenticating)?;
        let (op, rx) = Startup::new(
            config.user.clone(),
            config.password.clone(),
            config.startup_params(),
            config.operation_timeout,
        );
        self.call(op, rx).await?;
        self.state.transition(ConnectionState::Idle)?;

        tracing::info!(
            encrypted = self.is_encrypted(),
            server_version = self.session.parameter("server_version").unwrap_or("unknown"),
            "connection established"
        );
        Ok(())
    }

    /// Run `op` and wait for the result it delivers through its completion
    async fn call<O, T>(&mut self, mut op: O, rx: oneshot::Receiver<Result<T>>) -> Result<T>
    where
        O: Operation,
    {
        self.run(&mut op).await;
        // an operation that finished without completing reports that on drop
        drop(op);
        rx.await.map_err(|_| Error::InvalidState {
            expected: "operation result".into(),
            actual: "result channel closed".into(),
        })?
    }

    /// Run `op` through the decide loop, then hand the connection to its pool: healthy
    /// after `Finished`, unhealthy after `Terminate` or failure.
    pub async fn execute<O: Operation>(mut self, mut op: O) -> Outcome {
        let outcome = self.run(&mut op).await;
        let pool = Arc::clone(&self.pool);
        if outcome.is_healthy() {
            pool.good(self);
        } else {
            pool.bad(self);
        }
        outcome
    }

    /// Run `op` through the decide loop, keeping the connection
    pub async fn run(&mut self, op: &mut dyn Operation) -> Outcome {
        let span = tracing::debug_span!("operation", conn = self.id, op = op.name());
        let started = Instant::now();
        let outcome = self.decide(op).instrument(span).await;
        counters::operation_completed(outcome.label());
        histograms::operation_duration(
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        outcome
    }

    async fn decide(&mut self, op: &mut dyn Operation) -> Outcome {
        if !self.state.is_runnable() {
            let err = if self.state == ConnectionState::Closed {
                Error::ConnectionClosed
            } else {
                Error::InvalidState {
                    expected: "idle connection".into(),
                    actual: self.state.to_string(),
                }
            };
            op.on_fail(err);
            return Outcome::Failed;
        }
        let resting = self.state;
        if resting == ConnectionState::Idle {
            // Idle -> Executing is always valid
            let _ = self.state.transition(ConnectionState::Executing);
        }

        let mut oob = self.oob.clone();
        op.out_of_band(&mut oob);
        let deadline = op.timeout();

        self.read.clear();
        self.write.clear();
        let mut step = op.on_start(&mut exchange!(self, &oob));

        loop {
            let next = match step {
                Ok(next) => next,
                Err(err) => return self.fail(op, err).await,
            };
            tracing::trace!(?next, "decide");
            step = match next {
                Next::Start => {
                    self.read.clear();
                    self.write.clear();
                    op.on_start(&mut exchange!(self, &oob))
                }
                Next::Read { needs } => match within(deadline, self.fill(needs)).await {
                    Some(Ok(n)) => {
                        counters::bytes_read(n as u64);
                        let step = op.on_read(&mut exchange!(self, &oob));
                        self.read.compact();
                        step
                    }
                    Some(Err(err)) => Err(err),
                    None => {
                        counters::operation_timeout();
                        tracing::debug!(?deadline, "read timed out");
                        op.on_timeout(&mut exchange!(self, &oob))
                    }
                },
                Next::Write => match within(deadline, self.flush()).await {
                    Some(Ok(())) => op.on_write(&mut exchange!(self, &oob)),
                    Some(Err(err)) => Err(err),
                    None => {
                        counters::operation_timeout();
                        tracing::debug!(?deadline, "write timed out");
                        op.on_timeout(&mut exchange!(self, &oob))
                    }
                },
                Next::Finished => {
                    if self.state == ConnectionState::Executing {
                        let _ = self.state.transition(resting);
                    }
                    return Outcome::Finished;
                }
                Next::Terminate => {
                    tracing::debug!("operation requested close");
                    self.shutdown().await;
                    return Outcome::Terminated;
                }
            };
        }
    }

    async fn fail(&mut self, op: &mut dyn Operation, err: Error) -> Outcome {
        tracing::debug!(error = %err, "operation failed, closing connection");
        op.on_fail(err);
        self.shutdown().await;
        Outcome::Failed
    }

    /// Read once into the read buffer, growing it for `needs` bytes first
    async fn fill(&mut self, needs: usize) -> Result<usize> {
        self.read.reserve(needs.max(1))?;
        self.mode.read(&mut self.transport, &mut self.read).await
    }

    /// Transmit everything transmittable, moving deferred output in as space frees up
    async fn flush(&mut self) -> Result<()> {
        self.write.prepare_flush();
        loop {
            while !self.write.is_empty() {
                let n = self
                    .mode
                    .write(&mut self.transport, self.write.readable())
                    .await?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
                self.write.consume(n);
                counters::bytes_written(n as u64);
            }
            if self.write.drain() == 0 {
                return self.mode.flush(&mut self.transport).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state != ConnectionState::Closed {
            let _ = self.state.transition(ConnectionState::Closed);
            self.mode.shutdown(&mut self.transport).await;
        }
    }

    /// Send Terminate and close the socket. A pooled connection is retired from its pool.
    pub async fn close(mut self) -> Result<()> {
        let result = if self.is_closed() {
            Ok(())
        } else {
            let (op, rx) = Terminate::new();
            self.call(op, rx).await
        };
        let pool = Arc::clone(&self.pool);
        pool.bad(self);
        result
    }

    /// Run a simple query
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let (mut op, rx) = SimpleQuery::new(sql);
        if let Some(timeout) = self.timeout {
            op = op.with_timeout(timeout);
        }
        self.call(op, rx).await
    }

    /// Run a statement through the extended protocol, preparing it on first use
    pub async fn prepared(&mut self, sql: &str, params: Vec<Value>) -> Result<QueryResult> {
        let (mut op, rx) = PreparedQuery::new(sql, params);
        if let Some(timeout) = self.timeout {
            op = op.with_timeout(timeout);
        }
        self.call(op, rx).await
    }

    /// Run statements one after another, collecting every result
    pub async fn batch<I, S>(&mut self, statements: I) -> Result<Vec<QueryResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (mut op, rx) = Batch::new(statements);
        if let Some(timeout) = self.timeout {
            op = op.with_timeout(timeout);
        }
        self.call(op, rx).await
    }

    /// Connection id used in logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the socket has been closed
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether TLS is active (or its handshake pending)
    pub fn is_encrypted(&self) -> bool {
        self.mode.is_tls()
    }

    /// Session state reported by the backend
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Mutable session state (e.g. to take notifications)
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Prepared statements known on this connection
    pub fn statements(&self) -> &StatementCache {
        &self.statements
    }

    /// Install a handler for an out-of-band tag on every later operation
    pub fn set_out_of_band(&mut self, tag: u8, handler: OobHandler) {
        self.oob.set(tag, handler);
    }

    /// Replace the column codec registry
    pub fn set_types(&mut self, types: Arc<TypeRegistry>) {
        self.types = types;
    }

    /// Default deadline used by [`query`](Self::query), [`prepared`](Self::prepared) and
    /// [`batch`](Self::batch)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub(crate) fn attach(&mut self, pool: Arc<dyn ConnectionPool>) {
        self.pool = pool;
    }

    /// Count this connection against a pool's bounds until it is dropped
    pub(crate) fn set_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
    }

    /// Release the pool slot now and stop returning to the pool
    pub(crate) fn detach(&mut self) {
        self.pool = Arc::new(Detached);
        self.lease = None;
    }

    /// Whether a pool counts this connection against its bounds
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Token able to cancel whatever this connection is running, from another task
    pub fn cancel_token(&self) -> Option<CancelToken> {
        Some(CancelToken {
            target: self.cancel_target.clone()?,
            key: self.session.backend_key?,
        })
    }
}

#[derive(Debug, Clone)]
enum CancelTarget {
    Tcp { host: String, port: u16 },
    #[cfg_attr(not(unix), allow(dead_code))]
    Unix(PathBuf),
}

/// Everything needed to send a CancelRequest for one backend
#[derive(Debug, Clone)]
pub struct CancelToken {
    target: CancelTarget,
    key: BackendKey,
}

impl CancelToken {
    /// Backend this token cancels
    pub fn backend_key(&self) -> BackendKey {
        self.key
    }

    /// Open a fresh socket, send CancelRequest and wait for the server to hang up.
    ///
    /// The server gives no answer; success only means the request was delivered.
    pub async fn cancel(&self) -> Result<()> {
        let mut transport = match &self.target {
            CancelTarget::Tcp { host, port } => {
                Transport::connect_tcp(host, *port, Some(Duration::from_secs(10))).await?
            }
            #[cfg(unix)]
            CancelTarget::Unix(path) => Transport::connect_unix(path).await?,
            #[cfg(not(unix))]
            CancelTarget::Unix(_) => {
                return Err(Error::Config("unix sockets are not supported".into()))
            }
        };
        send_cancel(&mut transport, self.key).await
    }
}

pub(crate) async fn send_cancel(transport: &mut Transport, key: BackendKey) -> Result<()> {
    let request = encode_message(&FrontendMessage::CancelRequest {
        process_id: key.process_id,
        secret_key: key.secret_key,
    })?;
    transport.write_all(&request).await?;
    transport.flush().await?;
    let mut scratch = [0u8; 64];
    while transport.read(&mut scratch).await? > 0 {}
    tracing::debug!(pid = key.process_id, "cancel request sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::testing::{command_complete, data_row, error_response, msg, ready, row_description};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn plain(stream: DuplexStream) -> Connection {
        let mut conn = Connection::new(Transport::from_stream(stream), 0).unwrap();
        conn.state = ConnectionState::Idle;
        conn
    }

    /// Finishes after `reads` read cycles
    struct CountReads {
        reads: usize,
        seen: usize,
        failed: Option<Error>,
        timeouts: usize,
        timeout: Option<Duration>,
    }

    impl CountReads {
        fn new(reads: usize) -> Self {
            Self {
                reads,
                seen: 0,
                failed: None,
                timeouts: 0,
                timeout: None,
            }
        }
    }

    impl Operation for CountReads {
        fn on_start(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
            Ok(Next::read())
        }

        fn on_read(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
            let n = cx.read.len();
            cx.read.consume(n);
            self.seen += 1;
            if self.seen == self.reads {
                return Ok(Next::Finished);
            }
            // acknowledge so the peer sends the next byte
            cx.write.write_message(&FrontendMessage::Flush)?;
            Ok(Next::Write)
        }

        fn on_timeout(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
            self.timeouts += 1;
            Ok(Next::Finished)
        }

        fn on_fail(&mut self, err: Error) {
            self.failed = Some(err);
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
    }

    #[tokio::test]
    async fn test_finishes_after_exact_read_count() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = plain(client);
        let mut op = CountReads::new(3);

        let backend = tokio::spawn(async move {
            let mut ack = [0u8; 5];
            for round in 0..3 {
                server.write_all(b"x").await.unwrap();
                if round < 2 {
                    server.read_exact(&mut ack).await.unwrap();
                    assert_eq!(ack[0], b'H');
                }
            }
            server
        });

        assert_eq!(conn.run(&mut op).await, Outcome::Finished);
        assert_eq!(op.seen, 3);
        assert_eq!(conn.state(), ConnectionState::Idle);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_goes_to_on_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = plain(client);
        let mut op = CountReads::new(1);
        op.timeout = Some(Duration::from_millis(20));

        assert_eq!(conn.run(&mut op).await, Outcome::Finished);
        assert_eq!(op.timeouts, 1);
        assert!(op.failed.is_none());
    }

    #[tokio::test]
    async fn test_peer_close_fails_and_closes() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut conn = plain(client);
        let mut op = CountReads::new(1);

        assert_eq!(conn.run(&mut op).await, Outcome::Failed);
        assert!(matches!(op.failed, Some(Error::ConnectionClosed)));
        assert!(conn.is_closed());

        // a closed connection fails the next operation immediately
        let mut next = CountReads::new(1);
        assert_eq!(conn.run(&mut next).await, Outcome::Failed);
        assert!(matches!(next.failed, Some(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_callback_error_is_hard_failure() {
        struct Broken(Option<Error>);
        impl Operation for Broken {
            fn on_start(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
                Err(Error::Protocol("bad request".into()))
            }
            fn on_read(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
                Ok(Next::Finished)
            }
            fn on_fail(&mut self, err: Error) {
                self.0 = Some(err);
            }
        }

        let (client, _server) = tokio::io::duplex(64);
        let mut conn = plain(client);
        let mut op = Broken(None);
        assert_eq!(conn.run(&mut op).await, Outcome::Failed);
        assert!(matches!(op.0, Some(Error::Protocol(_))));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_start_restarts_with_clear_buffers() {
        struct TwoPhase {
            starts: usize,
        }
        impl Operation for TwoPhase {
            fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
                assert!(cx.read.is_empty());
                assert!(cx.write.is_empty());
                self.starts += 1;
                cx.write.write_message(&FrontendMessage::Sync)?;
                Ok(Next::Write)
            }
            fn on_write(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
                Ok(if self.starts < 2 { Next::Start } else { Next::Finished })
            }
            fn on_read(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
                Ok(Next::Finished)
            }
            fn on_fail(&mut self, _err: Error) {}
        }

        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = plain(client);
        let mut op = TwoPhase { starts: 0 };
        assert_eq!(conn.run(&mut op).await, Outcome::Finished);
        assert_eq!(op.starts, 2);

        let mut wire = [0u8; 10];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [b'S', 0, 0, 0, 4, b'S', 0, 0, 0, 4]);
    }

    #[tokio::test]
    async fn test_large_write_is_fully_transmitted() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = plain(client);
        let sql = format!("SELECT '{}'", "x".repeat(100_000));
        let expected = 1 + 4 + sql.len() + 1;

        let reader = tokio::spawn(async move {
            let mut wire = vec![0u8; expected];
            server.read_exact(&mut wire).await.unwrap();
            server.write_all(&command_complete("SELECT 0")).await.unwrap();
            server.write_all(&ready(b'I')).await.unwrap();
            wire
        });

        let result = conn.query(&sql).await.unwrap();
        assert_eq!(result.commands.len(), 1);
        let wire = reader.await.unwrap();
        assert_eq!(wire[0], b'Q');
        assert_eq!(&wire[5..wire.len() - 1], sql.as_bytes());
    }

    #[tokio::test]
    async fn test_query_collects_rows_and_session_stays_usable() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = plain(client);

        let backend = tokio::spawn(async move {
            let mut header = [0u8; 5];
            for round in 0..2 {
                server.read_exact(&mut header).await.unwrap();
                let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
                let mut body = vec![0u8; len - 4];
                server.read_exact(&mut body).await.unwrap();
                if round == 0 {
                    server.write_all(&error_response("42P01", "missing")).await.unwrap();
                } else {
                    server.write_all(&row_description(&[("n", 23)])).await.unwrap();
                    server.write_all(&data_row(&[Some(b"7")])).await.unwrap();
                    server.write_all(&msg(b'S', b"TimeZone\0UTC\0")).await.unwrap();
                    server.write_all(&command_complete("SELECT 1")).await.unwrap();
                }
                server.write_all(&ready(b'I')).await.unwrap();
            }
        });

        let err = conn.query("SELECT * FROM nope").await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(!conn.is_closed());

        let result = conn.query("SELECT 7").await.unwrap();
        assert_eq!(result.rows[0].get_str(0).unwrap(), Some("7"));
        assert_eq!(conn.session().parameter("TimeZone"), Some("UTC"));
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_returns_connection_to_pool() {
        #[derive(Default)]
        struct Counting {
            good: AtomicUsize,
            bad: AtomicUsize,
        }
        impl ConnectionPool for Counting {
            fn fast(&self) -> Option<Connection> {
                None
            }
            fn guaranteed(&self) -> Result<Connection> {
                Err(Error::PoolClosed)
            }
            fn good(&self, _conn: Connection) {
                self.good.fetch_add(1, Ordering::SeqCst);
            }
            fn bad(&self, _conn: Connection) {
                self.bad.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = Arc::new(Counting::default());
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"x").await.unwrap();
        let mut conn = plain(client);
        conn.attach(pool.clone());
        assert_eq!(conn.execute(CountReads::new(1)).await, Outcome::Finished);
        assert_eq!(pool.good.load(Ordering::SeqCst), 1);

        drop(server);
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut conn = plain(client);
        conn.attach(pool.clone());
        assert_eq!(conn.execute(CountReads::new(1)).await, Outcome::Failed);
        assert_eq!(pool.good.load(Ordering::SeqCst), 1);
        assert_eq!(pool.bad.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_cancel() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut transport = Transport::from_stream(client);
        let backend = tokio::spawn(async move {
            let mut wire = [0u8; 16];
            server.read_exact(&mut wire).await.unwrap();
            wire
        });
        let key = BackendKey {
            process_id: 42,
            secret_key: 7,
        };
        send_cancel(&mut transport, key).await.unwrap();
        let wire = backend.await.unwrap();
        assert_eq!(&wire[0..4], &16i32.to_be_bytes());
        assert_eq!(&wire[4..8], &80877102i32.to_be_bytes());
        assert_eq!(&wire[8..12], &42i32.to_be_bytes());
        assert_eq!(&wire[12..16], &7i32.to_be_bytes());
    }
}
