//! Bounded exponential backoff for polling long-running cloud operations
//! and for retrying transient per-call failures.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{BackupError, Result, Service};

/// Backoff schedule: fixed initial interval, capped growth, maximum attempts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the second attempt, in milliseconds.
    pub initial_interval_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_interval_ms: u64,
    /// Attempts allowed before the operation is permanently failed.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            multiplier: 2.0,
            max_interval_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    pub fn creation() -> Self {
        Self {
            initial_interval_ms: 5_000,
            multiplier: 2.0,
            max_interval_ms: 60_000,
            max_attempts: 30,
        }
    }

    pub fn upload() -> Self {
        Self {
            initial_interval_ms: 30_000,
            multiplier: 1.5,
            max_interval_ms: 300_000,
            max_attempts: 60,
        }
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_interval_ms as f64 * self.multiplier.max(1.0).powi(attempt as i32);
        let capped = base.min(self.max_interval_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// What a single poll observed.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    Done(T),
    Pending(String),
    Failed(String),
}

/// Races `fut` against the cancellation token.
pub async fn cancellable<T, F>(cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled(format!("{what} interrupted"))),
        res = fut => res,
    }
}

/// Bounds a single external call. An elapsed timeout is treated as transient.
pub async fn with_timeout<T, F>(service: Service, limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(BackupError::transient(
            service,
            format!("{what} timed out after {}s", limit.as_secs_f64()),
        )),
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, what: &str, delay: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled(format!("{what} interrupted while waiting"))),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Runs `operation`, retrying retryable failures with backoff until the
/// attempt budget is spent. Non-retryable failures return immediately.
pub async fn retry_call<F, Fut, T>(
    what: &str,
    config: &BackoffConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match cancellable(cancel, what, operation()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts.max(1) => {
                let delay = config.delay_for(attempt - 1);
                warn!(operation = what, attempt, error = %e, "Transient failure, retrying in {:?}", delay);
                sleep_or_cancel(cancel, what, delay).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Polls `check` until it reports done or failed. Running out of attempts
/// while still pending is a terminal failure attributed to `service`.
pub async fn poll_until<F, Fut, T>(
    what: &str,
    service: Service,
    config: &BackoffConfig,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_state = String::new();
    for attempt in 1..=max_attempts {
        match cancellable(cancel, what, check()).await? {
            PollStatus::Done(value) => {
                debug!(operation = what, attempt, "Poll finished");
                return Ok(value);
            }
            PollStatus::Failed(reason) => {
                return Err(BackupError::external(service, format!("{what} failed: {reason}")));
            }
            PollStatus::Pending(state) => {
                debug!(operation = what, attempt, state = %state, "Still pending");
                last_state = state;
            }
        }
        if attempt < max_attempts {
            sleep_or_cancel(cancel, what, config.delay_for(attempt - 1)).await?;
        }
    }
    Err(BackupError::external(
        service,
        format!("{what} did not complete after {max_attempts} attempts (last state: {last_state})"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_interval_ms: 1,
            multiplier: 2.0,
            max_interval_ms: 4,
            max_attempts,
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let cfg = BackoffConfig {
            initial_interval_ms: 100,
            multiplier: 2.0,
            max_interval_ms: 500,
            max_attempts: 10,
        };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(400));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(500));
        assert_eq!(cfg.delay_for(20), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_poll_until_returns_done_value() -> anyhow::Result<()> {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let value = poll_until("creation", Service::DiskSnapshot, &fast(5), &cancel, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n < 2 { PollStatus::Pending("RUNNING".into()) } else { PollStatus::Done(n) })
        })
        .await?;
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_until_exhaustion_is_terminal() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let res: Result<()> = poll_until("upload", Service::DiskSnapshot, &fast(3), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(PollStatus::Pending("UPLOADING".into()))
        })
        .await;
        let err = res.unwrap_err();
        assert!(matches!(err, BackupError::ExternalService { .. }));
        assert!(err.to_string().contains("UPLOADING"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_failed_stops_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let res: Result<()> = poll_until("creation", Service::DiskSnapshot, &fast(5), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(PollStatus::Failed("QUOTA_EXCEEDED".into()))
        })
        .await;
        assert!(res.unwrap_err().to_string().contains("QUOTA_EXCEEDED"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<()> = poll_until("creation", Service::DiskSnapshot, &fast(5), &cancel, || async {
            Ok(PollStatus::Pending("RUNNING".into()))
        })
        .await;
        assert!(res.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_retry_call_retries_only_transient_errors() -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let value = retry_call("get", &fast(4), &cancel, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BackupError::transient(Service::DiskSnapshot, "503"))
            } else {
                Ok("ok")
            }
        })
        .await?;
        assert_eq!(value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let res: Result<()> = retry_call("get", &fast(4), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackupError::external(Service::DiskSnapshot, "404"))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_call_gives_up_after_budget() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry_call("get", &fast(3), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackupError::transient(Service::Database, "timeout"))
        })
        .await;
        assert!(res.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
