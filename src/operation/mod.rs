//! Operation contract
//!
//! An [`Operation`] is one request/response exchange (or a multi-stage exchange) bound to
//! a single connection. The connection driver calls its callbacks and follows the
//! [`Next`] step each callback returns; the operation itself never touches the socket.
//!
//! Results leave an operation through a [`Completion`], which wraps a oneshot channel
//! and completes exactly once whether the operation finishes, fails or is dropped.

pub mod batch;
pub mod pump;
pub mod query;
pub mod ssl;
pub mod startup;
pub mod terminate;

use crate::protocol::{
    BackendMessage, Buffer, Encoder, ErrorFields, FieldDescription, Notification,
    TransactionStatus, TypeRegistry,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub use batch::Batch;
pub use pump::{DiscardRows, Flow, Pump};
pub use query::{PreparedQuery, QueryResult, Row, SimpleQuery};
pub use ssl::SslProbe;
pub use startup::Startup;
pub use terminate::Terminate;

/// What the driver should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Clear both buffers and call `on_start` again
    Start,
    /// Read from the socket; `needs` is the minimum number of further bytes required
    Read {
        /// Bytes required before parsing can progress (0 = any)
        needs: usize,
    },
    /// Transmit the write buffer
    Write,
    /// Done; return the connection to the pool as healthy
    Finished,
    /// Done; close the socket and report the connection as unhealthy
    Terminate,
}

impl Next {
    /// Read whatever arrives next
    pub fn read() -> Self {
        Next::Read { needs: 0 }
    }

    /// Read at least `needs` more bytes
    pub fn read_at_least(needs: usize) -> Self {
        Next::Read { needs }
    }
}

/// Connection-owned state an operation works on during one callback
pub struct Exchange<'a> {
    /// Received bytes not yet parsed
    pub read: &'a mut Buffer,
    /// Outbound encoder
    pub write: &'a mut Encoder,
    /// Session state (parameters, key data, transaction status)
    pub session: &'a mut Session,
    /// Prepared statements keyed by SQL text
    pub statements: &'a mut StatementCache,
    /// Out-of-band handlers for this execution
    pub oob: &'a OobHandlers,
    /// Column codecs
    pub types: &'a TypeRegistry,
}

impl fmt::Debug for Exchange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("read", &self.read.len())
            .field("write", &self.write.readable().len())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// State machine for one exchange with the backend
pub trait Operation: Send {
    /// Name used in logs and spans
    fn name(&self) -> &'static str {
        "operation"
    }

    /// Build the request (or do nothing and read)
    fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next>;

    /// Parse newly received bytes
    fn on_read(&mut self, cx: &mut Exchange<'_>) -> Result<Next>;

    /// The write buffer was fully transmitted
    fn on_write(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let _ = cx;
        Ok(Next::read())
    }

    /// A read or write exceeded [`timeout`](Self::timeout). Returning an error turns the
    /// timeout into a hard failure.
    fn on_timeout(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let _ = cx;
        Err(Error::Timeout)
    }

    /// Hard failure; the connection is destroyed afterwards
    fn on_fail(&mut self, err: Error);

    /// Deadline applied to each socket read and write
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Register operation-scoped out-of-band handlers on top of the connection's own
    fn out_of_band(&self, handlers: &mut OobHandlers) {
        let _ = handlers;
    }
}

/// Backend cancellation key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    /// Backend process ID
    pub process_id: i32,
    /// Secret key
    pub secret_key: i32,
}

/// Session-level state captured from the backend
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Server parameters reported by ParameterStatus
    pub parameters: HashMap<String, String>,
    /// Cancellation key from BackendKeyData
    pub backend_key: Option<BackendKey>,
    /// Status from the last ReadyForQuery
    pub transaction_status: TransactionStatus,
    /// Last NoticeResponse
    pub last_notice: Option<ErrorFields>,
    /// Last ErrorResponse seen by a pump
    pub last_error: Option<ErrorFields>,
    /// Notifications received and not yet taken
    pub notifications: Vec<Notification>,
}

impl Session {
    /// Server parameter value
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Take the queued notifications
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}

/// Out-of-band message handler
pub type OobHandler = Arc<dyn Fn(&BackendMessage, &mut Session) + Send + Sync>;

/// Handlers for asynchronously delivered messages, keyed by tag
#[derive(Clone)]
pub struct OobHandlers {
    handlers: HashMap<u8, OobHandler>,
}

impl fmt::Debug for OobHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<char> = self.handlers.keys().map(|&t| t as char).collect();
        tags.sort_unstable();
        f.debug_struct("OobHandlers").field("tags", &tags).finish()
    }
}

impl Default for OobHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl OobHandlers {
    /// Handlers that record notices, parameter changes and notifications in the session
    pub fn new() -> Self {
        use crate::protocol::constants::tags;

        let mut table = Self::empty();
        table.set(
            tags::NOTICE_RESPONSE,
            Arc::new(|msg, session| {
                if let BackendMessage::NoticeResponse(fields) = msg {
                    tracing::debug!(notice = %fields, "backend notice");
                    session.last_notice = Some(fields.clone());
                }
            }),
        );
        table.set(
            tags::PARAMETER_STATUS,
            Arc::new(|msg, session| {
                if let BackendMessage::ParameterStatus { name, value } = msg {
                    tracing::debug!(%name, %value, "parameter status");
                    session.parameters.insert(name.clone(), value.clone());
                }
            }),
        );
        table.set(
            tags::NOTIFICATION_RESPONSE,
            Arc::new(|msg, session| {
                if let BackendMessage::NotificationResponse(n) = msg {
                    tracing::debug!(channel = %n.channel, pid = n.process_id, "notification");
                    session.notifications.push(n.clone());
                }
            }),
        );
        table
    }

    /// Table with no handlers
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Install (or replace) the handler for `tag`
    pub fn set(&mut self, tag: u8, handler: OobHandler) {
        self.handlers.insert(tag, handler);
    }

    /// Stop treating `tag` as out-of-band
    pub fn remove(&mut self, tag: u8) {
        self.handlers.remove(&tag);
    }

    /// Handler for `tag`
    pub fn get(&self, tag: u8) -> Option<&OobHandler> {
        self.handlers.get(&tag)
    }
}

/// A prepared statement known to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Server-side statement name
    pub name: String,
    /// Parameter type OIDs from ParameterDescription
    pub param_types: Vec<u32>,
    /// Result columns, empty for statements returning no rows
    pub fields: Vec<FieldDescription>,
}

/// Prepared statements keyed by SQL text
#[derive(Debug, Clone, Default)]
pub struct StatementCache {
    statements: HashMap<String, PreparedStatement>,
    counter: u64,
}

impl StatementCache {
    /// Statement prepared for `sql`
    pub fn get(&self, sql: &str) -> Option<&PreparedStatement> {
        self.statements.get(sql)
    }

    /// Remember a prepared statement
    pub fn insert(&mut self, sql: impl Into<String>, statement: PreparedStatement) {
        self.statements.insert(sql.into(), statement);
    }

    /// Forget the statement for `sql`
    pub fn remove(&mut self, sql: &str) -> Option<PreparedStatement> {
        self.statements.remove(sql)
    }

    /// Fresh statement name unique on this connection
    pub fn next_name(&mut self) -> String {
        self.counter += 1;
        format!("pgpump_s{}", self.counter)
    }

    /// Number of cached statements
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Single-shot result slot of an operation
#[derive(Debug)]
pub struct Completion<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Completion<T> {
    /// Completion and the receiver its result arrives on
    pub fn channel() -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the result. Later calls are ignored; returns whether this call delivered.
    pub fn complete(&mut self, result: Result<T>) -> bool {
        match self.tx.take() {
            // a dropped receiver just means nobody is waiting
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Whether a result was already delivered
    pub fn is_complete(&self) -> bool {
        self.tx.is_none()
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(Error::InvalidState {
                expected: "operation completed".into(),
                actual: "operation dropped without a result".into(),
            }));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Exchange fixture for operation unit tests

    use super::*;

    pub struct Fixture {
        pub read: Buffer,
        pub write: Encoder,
        pub session: Session,
        pub statements: StatementCache,
        pub oob: OobHandlers,
        pub types: TypeRegistry,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self {
                read: Buffer::with_capacity(0, "test").unwrap(),
                write: Encoder::with_capacity(0).unwrap(),
                session: Session::default(),
                statements: StatementCache::default(),
                oob: OobHandlers::new(),
                types: TypeRegistry::new(),
            }
        }

        pub fn cx(&mut self) -> Exchange<'_> {
            Exchange {
                read: &mut self.read,
                write: &mut self.write,
                session: &mut self.session,
                statements: &mut self.statements,
                oob: &self.oob,
                types: &self.types,
            }
        }

        /// Append backend bytes as if read from the socket
        pub fn feed(&mut self, bytes: &[u8]) {
            self.read.reserve(bytes.len()).unwrap();
            self.read.spare_mut()[..bytes.len()].copy_from_slice(bytes);
            self.read.commit(bytes.len());
        }

        /// Take everything the operation wrote
        pub fn sent(&mut self) -> Vec<u8> {
            let out = self.write.readable().to_vec();
            self.write.clear();
            out
        }
    }

    /// Frame a backend message
    pub fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub fn ready(status: u8) -> Vec<u8> {
        msg(b'Z', &[status])
    }

    pub fn command_complete(tag: &str) -> Vec<u8> {
        let mut body = tag.as_bytes().to_vec();
        body.push(0);
        msg(b'C', &body)
    }

    pub fn error_response(code: &str, message: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"SERROR\0C");
        body.extend_from_slice(code.as_bytes());
        body.extend_from_slice(b"\0M");
        body.extend_from_slice(message.as_bytes());
        body.extend_from_slice(b"\0\0");
        msg(b'E', &body)
    }

    pub fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
        let mut body = (columns.len() as i16).to_be_bytes().to_vec();
        for (name, oid) in columns {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
            body.extend_from_slice(&0i32.to_be_bytes());
            body.extend_from_slice(&0i16.to_be_bytes());
            body.extend_from_slice(&oid.to_be_bytes());
            body.extend_from_slice(&(-1i16).to_be_bytes());
            body.extend_from_slice(&(-1i32).to_be_bytes());
            body.extend_from_slice(&0i16.to_be_bytes());
        }
        msg(b'T', &body)
    }

    pub fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut body = (values.len() as i16).to_be_bytes().to_vec();
        for v in values {
            match v {
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(b) => {
                    body.extend_from_slice(&(b.len() as i32).to_be_bytes());
                    body.extend_from_slice(b);
                }
            }
        }
        msg(b'D', &body)
    }
}
