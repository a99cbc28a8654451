//! Error classification and reconnect backoff
//!
//! Connectivity problems are never surfaced as errors to the document; they
//! turn into `sync: false` signals. The transport still needs to decide
//! whether a failure is worth another attempt and how long to wait, which is
//! what this module provides.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of consecutive failed attempts, 0 for unbounded
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 2_500,
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create an aggressive retry policy
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 50,
            backoff_multiplier: 1.5,
            max_delay_ms: 1_000,
        }
    }

    /// Whether attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }

    /// Delay to wait after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Socket-level failures (retryable)
    Network,

    /// Handshake or read timeouts (retryable)
    Timeout,

    /// Peer spoke something we could not understand (retryable)
    Protocol,

    /// Malformed endpoint or settings (not retryable)
    Configuration,

    /// Unknown errors
    Unknown,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Configuration)
    }
}

/// Categorize an error
pub fn categorize_error(error: &anyhow::Error) -> ErrorCategory {
    for cause in error.chain() {
        if let Some(ws) = cause.downcast_ref::<tungstenite::Error>() {
            return match ws {
                tungstenite::Error::Url(_) => ErrorCategory::Configuration,
                tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                    ErrorCategory::Timeout
                }
                tungstenite::Error::Io(_)
                | tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed => ErrorCategory::Network,
                tungstenite::Error::Protocol(_) | tungstenite::Error::Http(_) => {
                    ErrorCategory::Protocol
                }
                _ => ErrorCategory::Unknown,
            };
        }
        if cause.downcast_ref::<url::ParseError>().is_some() {
            return ErrorCategory::Configuration;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return ErrorCategory::Network;
        }
    }

    let error_str = error.to_string().to_lowercase();
    if error_str.contains("timeout") || error_str.contains("timed out") {
        ErrorCategory::Timeout
    } else if error_str.contains("connection") || error_str.contains("network") {
        ErrorCategory::Network
    } else if error_str.contains("decode") || error_str.contains("protocol") {
        ErrorCategory::Protocol
    } else if error_str.contains("invalid") || error_str.contains("config") {
        ErrorCategory::Configuration
    } else {
        ErrorCategory::Unknown
    }
}
