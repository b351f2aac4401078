//! Error types for the connection pool
//!
//! Dial failures never appear here: they are returned to the caller as the
//! dialer's own error type.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Failed to close pooled connections: {0}")]
    Teardown(#[from] TeardownError),
}

/// Aggregate of every connection close that failed during one teardown pass.
#[derive(Error, Debug, Clone, Default)]
#[error("{} connection(s) failed to close: {}", .failures.len(), .failures.join("; "))]
pub struct TeardownError {
    failures: Vec<String>,
}

impl TeardownError {
    pub(crate) fn push(&mut self, err: impl std::fmt::Display) {
        self.failures.push(err.to_string());
    }

    pub(crate) fn into_result(self) -> Result<(), TeardownError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Number of connections that failed to close
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Messages of the individual close failures
    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
