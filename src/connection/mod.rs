//! Connection management
//!
//! This module handles:
//! * Session configuration (host, credentials, sslmode, timeouts, pool bounds)
//! * Transport abstraction (TCP, Unix socket, in-memory streams)
//! * Connection modes (plaintext, TLS handshake, TLS traffic)
//! * Lifecycle state machine enforcement
//! * The decide loop executing operations

pub mod config;
mod driver;
mod mode;
mod state;
mod tls;
mod transport;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use driver::{CancelToken, Connection, Outcome};
pub use state::ConnectionState;
pub use tls::{parse_server_name, SslMode, TlsConfig, TlsConfigBuilder};
pub use transport::{Socket, Transport};
