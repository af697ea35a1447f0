//! Time provider abstraction.
//!
//! Registry code takes its clock through [`TimeProvider`] so that sweeps and
//! shutdown deadlines run against whatever clock the host runtime supplies.
//! Tests drive it with tokio's paused clock; production uses wall time.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The awaited future did not complete within the deadline.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for clocks, sleeps and deadlines.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Elapsed time since the provider was created.
    fn now(&self) -> Duration;

    /// Sleep for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Run a future against a deadline.
    ///
    /// Returns `Ok(output)` if the future completes in time, otherwise
    /// `Err(TimeError::Elapsed)`.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>;
}

/// Tokio-backed time provider.
#[derive(Debug, Clone)]
pub struct TokioTime {
    start: std::time::Instant,
}

impl TokioTime {
    /// Create a provider anchored at the current instant.
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTime {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}
