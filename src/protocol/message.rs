//! Protocol message types

use super::constants::tx_status;
use bytes::Bytes;
use std::fmt;

/// Frontend message (client → server)
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Bind parameters to a prepared statement, producing a portal
    Bind {
        /// Destination portal (empty for unnamed)
        portal: String,
        /// Source statement (empty for unnamed)
        statement: String,
        /// Parameter format codes (empty = all text)
        param_formats: Vec<Format>,
        /// Encoded parameter values; `None` is SQL NULL
        params: Vec<Option<Bytes>>,
        /// Result column format codes (empty = all text)
        result_formats: Vec<Format>,
    },

    /// Cancel a running query on another connection
    CancelRequest {
        /// Backend process ID
        process_id: i32,
        /// Backend secret key
        secret_key: i32,
    },

    /// Close a statement or portal
    Close(Target),

    /// COPY payload chunk
    CopyData(Bytes),

    /// COPY finished
    CopyDone,

    /// COPY aborted with a reason
    CopyFail(String),

    /// Describe a statement or portal
    Describe(Target),

    /// Execute a portal
    Execute {
        /// Portal name (empty for unnamed)
        portal: String,
        /// Row limit, 0 for unlimited
        max_rows: i32,
    },

    /// Ask the backend to flush its output
    Flush,

    /// Legacy fast-path function call
    FunctionCall {
        /// Function OID
        function: u32,
        /// Argument format codes
        arg_formats: Vec<Format>,
        /// Arguments; `None` is SQL NULL
        args: Vec<Option<Bytes>>,
        /// Result format
        result_format: Format,
    },

    /// Create a prepared statement
    Parse {
        /// Statement name (empty for unnamed)
        name: String,
        /// SQL text
        query: String,
        /// Parameter type OIDs (0 = let the server infer)
        param_types: Vec<u32>,
    },

    /// Password message
    Password(String),

    /// SASL initial response message
    SaslInitialResponse {
        /// SASL mechanism name (e.g., "SCRAM-SHA-256")
        mechanism: String,
        /// SASL client first message data
        data: Vec<u8>,
    },

    /// SASL response message
    SaslResponse {
        /// SASL client final message data
        data: Vec<u8>,
    },

    /// Query message
    Query(String),

    /// SSLRequest message (TLS negotiation)
    SslRequest,

    /// Startup message
    Startup {
        /// Protocol version
        version: i32,
        /// Connection parameters
        params: Vec<(String, String)>,
    },

    /// End of an extended-protocol batch
    Sync,

    /// Terminate message
    Terminate,
}

/// Statement or portal target for Close / Describe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Prepared statement
    Statement(String),
    /// Portal
    Portal(String),
}

impl Target {
    /// Wire discriminator byte
    pub fn kind(&self) -> u8 {
        match self {
            Target::Statement(_) => b'S',
            Target::Portal(_) => b'P',
        }
    }

    /// Target name
    pub fn name(&self) -> &str {
        match self {
            Target::Statement(name) | Target::Portal(name) => name,
        }
    }
}

/// Value format code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    /// Text (0)
    #[default]
    Text,
    /// Binary (1)
    Binary,
}

impl Format {
    /// Wire code
    pub fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }

    /// From a wire code; anything but 1 is text
    pub fn from_code(code: i16) -> Self {
        if code == 1 {
            Format::Binary
        } else {
            Format::Text
        }
    }
}

/// Backend message (server → client)
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationMessage),

    /// Backend key data (for cancellation)
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Bind complete
    BindComplete,

    /// Close complete
    CloseComplete,

    /// Command complete
    CommandComplete(CommandComplete),

    /// COPY payload chunk
    CopyData(Bytes),

    /// COPY finished
    CopyDone,

    /// Backend is ready to receive COPY data
    CopyInResponse(CopyResponse),

    /// Backend is about to send COPY data
    CopyOutResponse(CopyResponse),

    /// Streaming replication COPY
    CopyBothResponse(CopyResponse),

    /// Fully buffered data row
    DataRow(Vec<Option<Bytes>>),

    /// Empty query string
    EmptyQueryResponse,

    /// Error response
    ErrorResponse(ErrorFields),

    /// Fast-path function result
    FunctionCallResponse(Option<Bytes>),

    /// Statement or portal returns no rows
    NoData,

    /// Notice response
    NoticeResponse(ErrorFields),

    /// LISTEN/NOTIFY notification
    NotificationResponse(Notification),

    /// Parameter type OIDs of a prepared statement
    ParameterDescription(Vec<u32>),

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Parse complete
    ParseComplete,

    /// Execute hit its row limit
    PortalSuspended,

    /// Ready for query
    ReadyForQuery(TransactionStatus),

    /// Row description
    RowDescription(Vec<FieldDescription>),
}

impl BackendMessage {
    /// Message name, for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::BackendKeyData { .. } => "BackendKeyData",
            Self::BindComplete => "BindComplete",
            Self::CloseComplete => "CloseComplete",
            Self::CommandComplete(_) => "CommandComplete",
            Self::CopyData(_) => "CopyData",
            Self::CopyDone => "CopyDone",
            Self::CopyInResponse(_) => "CopyInResponse",
            Self::CopyOutResponse(_) => "CopyOutResponse",
            Self::CopyBothResponse(_) => "CopyBothResponse",
            Self::DataRow(_) => "DataRow",
            Self::EmptyQueryResponse => "EmptyQueryResponse",
            Self::ErrorResponse(_) => "ErrorResponse",
            Self::FunctionCallResponse(_) => "FunctionCallResponse",
            Self::NoData => "NoData",
            Self::NoticeResponse(_) => "NoticeResponse",
            Self::NotificationResponse(_) => "NotificationResponse",
            Self::ParameterDescription(_) => "ParameterDescription",
            Self::ParameterStatus { .. } => "ParameterStatus",
            Self::ParseComplete => "ParseComplete",
            Self::PortalSuspended => "PortalSuspended",
            Self::ReadyForQuery(_) => "ReadyForQuery",
            Self::RowDescription(_) => "RowDescription",
        }
    }
}

/// Authentication message types
#[derive(Debug, Clone)]
pub enum AuthenticationMessage {
    /// Authentication OK
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 hash
        salt: [u8; 4],
    },

    /// SASL authentication mechanisms available (Postgres 10+)
    Sasl {
        /// List of SASL mechanism names (e.g., ["SCRAM-SHA-256"])
        mechanisms: Vec<String>,
    },

    /// SASL continuation message (server challenge)
    SaslContinue {
        /// SASL server first/continue message data
        data: Vec<u8>,
    },

    /// SASL final message (server verification)
    SaslFinal {
        /// SASL server final message data
        data: Vec<u8>,
    },
}

/// Parsed CommandComplete tag
///
/// Row count and OID are inferred from the trailing tokens of the tag text on a best-effort
/// basis: the last token is the row count when numeric, and a three-token tag whose middle
/// token is numeric (`INSERT oid rows`) carries an OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    /// Raw tag text, e.g. `UPDATE 3`
    pub tag: String,
    /// Leading command word
    pub command: String,
    /// Affected / returned row count, 0 when absent
    pub rows: u64,
    /// Whether the tag carried an OID
    pub has_oid: bool,
    /// The OID, when present
    pub oid: u32,
}

impl CommandComplete {
    /// Parse a tag string
    pub fn parse(tag: &str) -> Self {
        let tokens: Vec<&str> = tag.split(' ').collect();
        let command = tokens.first().copied().unwrap_or_default().to_string();

        let rows = if tokens.len() > 1 {
            tokens
                .last()
                .and_then(|t| t.parse::<u64>().ok())
                .unwrap_or(0)
        } else {
            0
        };

        let oid = if tokens.len() == 3 {
            tokens[1].parse::<u32>().ok()
        } else {
            None
        };

        Self {
            tag: tag.to_string(),
            command,
            rows,
            has_oid: oid.is_some(),
            oid: oid.unwrap_or(0),
        }
    }

    /// Whether the command modified rows
    pub fn is_mutation(&self) -> bool {
        matches!(
            self.command.as_str(),
            "INSERT" | "UPDATE" | "DELETE" | "MERGE"
        )
    }
}

/// Backend transaction status reported by ReadyForQuery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block
    #[default]
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// From the ReadyForQuery status byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            tx_status::IDLE => Some(Self::Idle),
            tx_status::IN_TRANSACTION => Some(Self::InTransaction),
            tx_status::FAILED => Some(Self::Failed),
            _ => None,
        }
    }
}

/// COPY response header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResponse {
    /// Overall format
    pub format: Format,
    /// Per-column formats
    pub column_formats: Vec<Format>,
}

/// LISTEN/NOTIFY notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Notifying backend process ID
    pub process_id: i32,
    /// Channel name
    pub channel: String,
    /// Payload
    pub payload: String,
}

/// Field description (column metadata)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: i32,
    /// Column attribute number (0 if not a table column)
    pub column_attr: i16,
    /// Data type OID
    pub type_oid: u32,
    /// Data type size
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format code (0 = text, 1 = binary)
    pub format_code: i16,
}

impl FieldDescription {
    /// Column format
    pub fn format(&self) -> Format {
        Format::from_code(self.format_code)
    }
}

/// Error/notice fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity (ERROR, WARNING, etc.)
    pub severity: Option<String>,
    /// SQLSTATE code
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
    /// Position in query string
    pub position: Option<String>,
    /// Context / call stack
    pub context: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref msg) = self.message {
            write!(f, "{}", msg)?;
        }
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        Ok(())
    }
}
