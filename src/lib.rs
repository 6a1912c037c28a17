//! pgpump: a completion-driven Postgres wire protocol engine
//!
//! The crate owns one physical connection per [`Connection`], executes caller-supplied
//! [`Operation`]s through a declarative next-step state machine, optionally interposes
//! TLS without the operation layer noticing, and provisions connections through a
//! bounded [`Pool`].
//!
//! Layers, leaves first:
//! * [`protocol`]: growable buffers, outbound encoder (with deferred length headers),
//!   backend framer and the incremental row decoder
//! * [`operation`]: the operation contract, the pump helper and the operations the
//!   engine needs itself (TLS probe, startup, simple query, batch, terminate)
//! * [`connection`]: transports, the plaintext / handshake / traffic handler modes and
//!   the decide loop
//! * [`pool`]: idle queue, provisioning with backoff, blocking and non-blocking acquisition

#![warn(missing_docs)]

pub mod auth;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod pool;
pub mod protocol;

pub use connection::{Connection, Outcome, SessionConfig, SslMode, TlsConfig, Transport};
pub use error::{Error, Result};
pub use operation::{Exchange, Next, Operation};
pub use pool::{ConnectionPool, Connector, PgConnector, Pool, PoolConfig, PoolStats};
