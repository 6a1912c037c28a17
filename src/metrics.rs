//! Metrics façade
//!
//! Thin wrappers over the `metrics` macros so call sites stay one line and metric
//! names live in one place. Without an installed recorder every call is a no-op.

/// Metric label values
pub mod labels {
    /// Operation reached FINISHED
    pub const OUTCOME_FINISHED: &str = "finished";
    /// Operation stepped to TERMINATE
    pub const OUTCOME_TERMINATED: &str = "terminated";
    /// Operation failed hard
    pub const OUTCOME_FAILED: &str = "failed";

    /// Cleartext password authentication
    pub const MECHANISM_CLEARTEXT: &str = "cleartext";
    /// SCRAM-SHA-256 authentication
    pub const MECHANISM_SCRAM: &str = "scram-sha-256";

    /// Read buffer
    pub const BUFFER_READ: &str = "read";
    /// Write buffer
    pub const BUFFER_WRITE: &str = "write";
}

/// Counters
pub mod counters {
    use metrics::counter;

    /// An operation left the decide loop
    pub fn operation_completed(outcome: &'static str) {
        counter!("pgpump_operations_total", "outcome" => outcome).increment(1);
    }

    /// A read or write hit the operation timeout
    pub fn operation_timeout() {
        counter!("pgpump_operation_timeouts_total").increment(1);
    }

    /// Bytes received from the socket (after TLS unwrap)
    pub fn bytes_read(n: u64) {
        counter!("pgpump_bytes_read_total").increment(n);
    }

    /// Bytes handed to the socket (before TLS wrap)
    pub fn bytes_written(n: u64) {
        counter!("pgpump_bytes_written_total").increment(n);
    }

    /// A buffer moved up the size ladder
    pub fn buffer_grown(buffer: &'static str) {
        counter!("pgpump_buffer_grows_total", "buffer" => buffer).increment(1);
    }

    /// Authentication succeeded
    pub fn auth_successful(mechanism: &'static str) {
        counter!("pgpump_auth_successful_total", "mechanism" => mechanism).increment(1);
    }

    /// Authentication failed
    pub fn auth_failed(mechanism: &'static str) {
        counter!("pgpump_auth_failed_total", "mechanism" => mechanism).increment(1);
    }

    /// TLS handshake completed
    pub fn tls_established() {
        counter!("pgpump_tls_established_total").increment(1);
    }

    /// Pool opened a connection
    pub fn pool_provisioned() {
        counter!("pgpump_pool_provisioned_total").increment(1);
    }

    /// Pool failed to open a connection and rescheduled
    pub fn pool_provision_failed() {
        counter!("pgpump_pool_provision_failures_total").increment(1);
    }

    /// A connection was retired as unhealthy
    pub fn pool_retired() {
        counter!("pgpump_pool_retired_total").increment(1);
    }
}

/// Histograms
pub mod histograms {
    use metrics::histogram;

    /// Wall time from `execute` to FINISHED / TERMINATE / failure
    pub fn operation_duration(millis: u64) {
        histogram!("pgpump_operation_duration_ms").record(millis as f64);
    }
}

/// Gauges
pub mod gauges {
    use metrics::gauge;

    /// Connections sitting in the idle queue
    pub fn pool_idle(n: usize) {
        gauge!("pgpump_pool_idle").set(n as f64);
    }

    /// Connections owned by the pool (idle + checked out)
    pub fn pool_total(n: usize) {
        gauge!("pgpump_pool_total").set(n as f64);
    }
}
