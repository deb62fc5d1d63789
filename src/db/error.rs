use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Error taxonomy shared across the engine. Callers match on the variant to
/// decide between retrying, yielding, and failing the run.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Bad arguments or unknown repository; reported, never retried.
    #[error("usage error: {0}")]
    Usage(String),

    /// Network, deadlock, rate limit; safe to retry with backoff.
    #[error("transient error: {0}")]
    Transient(#[source] anyhow::Error),

    /// Per-item failure (one file, one batch); logged and counted, the
    /// pipeline continues.
    #[error("data error: {0}")]
    Data(String),

    /// Illegal snapshot transition or constraint violation; fatal for the
    /// current run.
    #[error("state error: {0}")]
    State(String),

    /// Lost a race against a concurrent writer; the caller yields.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 3;

/// Run `op` up to three times, backing off exponentially (base 1s, cap 10s,
/// jittered) between attempts. Only transient errors are retried.
pub async fn retry<T, F, Fut>(label: &str, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
                let backoff = backoff.min(RETRY_CAP);
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                let delay = backoff + Duration::from_millis(jitter);
                warn!(%label, attempt, ?delay, %err, "transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<u32> = retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Transient(anyhow::anyhow!("flaky")))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::State("illegal transition".into())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::State(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
