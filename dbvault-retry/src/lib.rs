//! Unified retry and backoff logic for dbvault
//!
//! This crate provides consistent retry policies and backoff strategies for
//! the blocking filesystem and database calls made by the dbvault engines.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Boxed error carried by retry failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Default number of attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: BoxError,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: BoxError,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: BoxError,
    },
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Execute an operation with the default backoff policy and attempt limit
pub fn with_backoff<F, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> RetryResult<T>,
{
    with_custom_backoff(op_name, default_backoff_policy(), DEFAULT_MAX_ATTEMPTS, f)
}

/// Execute an operation with a custom backoff policy
///
/// The closure receives the 1-based attempt number. Returning
/// [`RetryError::Permanent`] stops immediately; any other error is retried
/// until `max_attempts` is reached or the policy's elapsed-time budget runs out.
pub fn with_custom_backoff<F, T>(
    op_name: &'static str,
    policy: ExponentialBackoff,
    max_attempts: usize,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> RetryResult<T>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    let result = backoff::retry_notify(
        policy,
        || {
            attempt += 1;
            debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

            match f(attempt) {
                Ok(value) => Ok(value),
                Err(err @ RetryError::Permanent { .. }) => Err(backoff::Error::permanent(err)),
                Err(err) if attempt >= max_attempts => {
                    Err(backoff::Error::permanent(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source: Box::new(err),
                    }))
                }
                Err(err) => Err(backoff::Error::transient(err)),
            }
        },
        |err: RetryError, wait: Duration| {
            warn!(
                "Operation '{}' failed, retrying in {:?}: {}",
                op_name, wait, err
            );
        },
    );

    match result {
        Ok(value) => {
            if attempt > 1 {
                debug!(
                    "Operation '{}' succeeded after {} attempts",
                    op_name, attempt
                );
            }
            Ok(value)
        }
        Err(backoff::Error::Permanent(err)) => {
            warn!(
                "Operation '{}' failed permanently on attempt {}",
                op_name, attempt
            );
            Err(err)
        }
        Err(backoff::Error::Transient { err, .. }) => Err(RetryError::MaxRetriesExceeded {
            operation: op_name,
            attempts: attempt,
            source: Box::new(err),
        }),
    }
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy for database round trips
pub fn database_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(20)))
        .with_multiplier(1.5)
        .build()
}

/// Backoff policy for local filesystem operations (shorter timeouts)
pub fn local_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(10)))
        .with_multiplier(2.0)
        .build()
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl RetryableError for std::io::Error {
    fn is_transient(&self) -> bool {
        use std::io::ErrorKind;

        matches!(
            self.kind(),
            ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
                | ErrorKind::PermissionDenied
        )
    }
}

/// Wrap an error into the matching [`RetryError`] variant
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation,
            source: Box::new(err),
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}
