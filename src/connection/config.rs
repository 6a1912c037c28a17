//! Session configuration
//!
//! Everything needed to open, secure and authenticate one connection, plus the pool
//! bounds used when connections are provisioned from it. Loadable from JSON; durations
//! are given in milliseconds (`operation_timeout_ms`, `connect_timeout_ms`, ...).

use super::tls::{SslMode, TlsConfig};
use crate::pool::PoolConfig;
use crate::protocol::buffer::{ladder_capacity, MIN_CAPACITY};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default read/write buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Connection configuration
///
/// ```ignore
/// let config = SessionConfig::builder("app")
///     .host("db.internal")
///     .password("secret")
///     .sslmode(SslMode::VerifyFull)
///     .operation_timeout(Duration::from_secs(30))
///     .build()?;
/// ```
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Host name, IP address, or Unix socket directory (starts with `/`)
    pub host: String,
    /// Port (also selects the Unix socket file)
    pub port: u16,
    /// Database name; the server defaults it to the user name
    pub database: Option<String>,
    /// Username
    pub user: String,
    /// Password (optional)
    pub password: Option<String>,
    /// Application name for Postgres logs
    pub application_name: Option<String>,
    /// Additional startup parameters
    pub params: BTreeMap<String, String>,
    /// SSL/TLS mode
    pub sslmode: SslMode,
    /// Initial buffer capacity, rounded up to a ladder rung
    pub buffer_size: usize,
    /// Deadline for every socket read and write of the built-in operations
    #[serde(rename = "operation_timeout_ms", with = "millis")]
    pub operation_timeout: Option<Duration>,
    /// TCP connect deadline
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Option<Duration>,
    /// Pool bounds and provisioning backoff
    pub pool: PoolConfig,
    /// Explicit TLS settings; derived from `sslmode` when absent
    #[serde(skip)]
    pub tls: Option<TlsConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            database: None,
            user: whoami::username(),
            password: None,
            application_name: None,
            params: BTreeMap::new(),
            sslmode: SslMode::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            operation_timeout: None,
            connect_timeout: Some(Duration::from_secs(10)),
            pool: PoolConfig::default(),
            tls: None,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("application_name", &self.application_name)
            .field("params", &self.params)
            .field("sslmode", &self.sslmode)
            .field("buffer_size", &self.buffer_size)
            .field("operation_timeout", &self.operation_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("pool", &self.pool)
            .field("tls", &self.tls)
            .finish()
    }
}

impl SessionConfig {
    /// Create a builder for `user`
    pub fn builder(user: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig {
                user: user.into(),
                ..SessionConfig::default()
            },
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid session config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that would only fail later, at connect time
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if ladder_capacity(self.buffer_size.max(MIN_CAPACITY)).is_none() {
            return Err(Error::Config(format!(
                "buffer_size {} exceeds the largest buffer",
                self.buffer_size
            )));
        }
        self.pool.validate()
    }

    /// Unix socket path when `host` names a socket directory
    pub fn unix_socket(&self) -> Option<PathBuf> {
        self.host
            .starts_with('/')
            .then(|| PathBuf::from(&self.host).join(format!(".s.PGSQL.{}", self.port)))
    }

    /// StartupMessage parameters other than `user`
    pub fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(database) = &self.database {
            params.push(("database".to_string(), database.clone()));
        }
        if let Some(name) = &self.application_name {
            params.push(("application_name".to_string(), name.clone()));
        }
        params.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }

    /// TLS settings to use if the server accepts encryption
    pub fn tls_config(&self) -> Result<TlsConfig> {
        match &self.tls {
            Some(tls) => Ok(tls.clone()),
            None => TlsConfig::for_mode(self.sslmode),
        }
    }
}

/// Builder for [`SessionConfig`]
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the host (or Unix socket directory)
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the database
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set application name for Postgres logs
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = Some(name.into());
        self
    }

    /// Add a startup parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.params.insert(key.into(), value.into());
        self
    }

    /// Set SSL/TLS mode
    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.config.sslmode = mode;
        self
    }

    /// Use explicit TLS settings
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Set the initial buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the per-I/O deadline of the built-in operations
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = Some(timeout);
        self
    }

    /// Set TCP connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Set pool bounds
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// `Option<Duration>` as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }

    /// Required duration variant
    pub fn required<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
