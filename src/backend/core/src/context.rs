//! Per-request deadline and cancellation scope.
//!
//! Every blocking collaborator call (directory, cache, rule engine, stores)
//! runs through [`RequestContext::run`], so a caller-supplied
//! [`CancellationToken`] or the configured per-call timeout aborts it with a
//! subsystem error instead of letting it hang.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{KeystoneError, Result};

/// Cancellation and timeout scope for one guarded request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl RequestContext {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tie the request to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Bound each collaborator call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use `timeout` only when the caller did not set one.
    pub fn or_timeout(mut self, timeout: Option<Duration>) -> Self {
        if self.timeout.is_none() {
            self.timeout = timeout;
        }
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one collaborator call under this context's deadline and token.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(KeystoneError::cancelled(operation));
        }

        let timeout = self.timeout;
        let bounded = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(KeystoneError::timeout(operation, limit)),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(KeystoneError::cancelled(operation)),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let ctx = RequestContext::new();
        let value = ctx.run("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(10));
        let err = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(err.is_subsystem_failure());
    }

    #[tokio::test]
    async fn test_run_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::new().with_cancellation(token);

        let err = ctx.run("never", async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn test_run_cancelled_in_flight() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new().with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = ctx
            .run("blocked", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        canceller.await.unwrap();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[test]
    fn test_or_timeout_keeps_caller_value() {
        let ctx = RequestContext::new()
            .with_timeout(Duration::from_millis(5))
            .or_timeout(Some(Duration::from_secs(1)));
        assert_eq!(ctx.timeout(), Some(Duration::from_millis(5)));

        let ctx = RequestContext::new().or_timeout(Some(Duration::from_secs(1)));
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(1)));
    }
}
