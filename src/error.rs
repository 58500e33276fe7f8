//! Error handling for the portnote scan core
//!
//! Job-level failures never terminate a worker: they are logged, reported on
//! the event stream and the worker moves on to the next job. The variants
//! below are what the public API surfaces to callers.

use std::time::Duration;
use thiserror::Error;

/// Main error type for scheduling, probing and persistence operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Host not found: {0}")]
    HostNotFound(i64),

    #[error("Port not found: {0}")]
    PortNotFound(i64),

    #[error("Port {number} already tracked for host {host_id}")]
    DuplicatePort { host_id: i64, number: u16 },

    #[error("Host name already in use: {0}")]
    DuplicateHost(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Probe error: {0}")]
    ProbeError(String),

    #[error("Probe timed out")]
    ProbeTimeout,

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Scan orchestrator is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type alias for scan operations
pub type ScanResult<T> = Result<T, ScanError>;

impl ScanError {
    /// Whether a later scan pass can be expected to succeed where this one failed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::ProbeError(_)
                | ScanError::ProbeTimeout
                | ScanError::StoreError(_)
                | ScanError::IoError(_)
        )
    }

    /// Short machine-friendly label used in logs and event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::HostNotFound(_) => "host_not_found",
            ScanError::PortNotFound(_) => "port_not_found",
            ScanError::DuplicatePort { .. } => "duplicate_port",
            ScanError::DuplicateHost(_) => "duplicate_host",
            ScanError::InvalidTarget(_) => "invalid_target",
            ScanError::ProbeError(_) => "probe_failure",
            ScanError::ProbeTimeout => "probe_failure",
            ScanError::StoreError(_) => "store_failure",
            ScanError::ShuttingDown => "shutting_down",
            ScanError::ConfigError(_) => "config",
            ScanError::IoError(_) => "io",
            ScanError::SerializationError(_) => "serialization",
        }
    }
}

impl From<tokio::time::error::Elapsed> for ScanError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ScanError::ProbeTimeout
    }
}

/// Delay before retry `attempt` (0-based), doubling from `base` and capped at `max`
pub fn retry_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(10));
    std::cmp::min(base.saturating_mul(factor), max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ScanError::ProbeTimeout.is_recoverable());
        assert!(ScanError::StoreError("locked".to_string()).is_recoverable());
        assert!(!ScanError::InvalidTarget("".to_string()).is_recoverable());
        assert!(!ScanError::HostNotFound(7).is_recoverable());
        assert!(!ScanError::ShuttingDown.is_recoverable());
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(ScanError::ProbeError("driver".into()).kind(), "probe_failure");
        assert_eq!(ScanError::ProbeTimeout.kind(), "probe_failure");
        assert_eq!(ScanError::HostNotFound(1).kind(), "host_not_found");
        assert_eq!(
            ScanError::DuplicatePort { host_id: 1, number: 22 }.to_string(),
            "Port 22 already tracked for host 1"
        );
    }

    #[test]
    fn test_retry_delay_calculation() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(2);

        assert_eq!(retry_delay(base, 0, max), Duration::from_millis(100));
        assert_eq!(retry_delay(base, 1, max), Duration::from_millis(200));
        assert_eq!(retry_delay(base, 2, max), Duration::from_millis(400));
        assert_eq!(retry_delay(base, 10, max), max); // Capped
    }
}
