use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed-interval polling with an overall ceiling.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between two evaluations of the condition
    pub interval: Duration,
    /// Give up once the next evaluation would start after this much time
    pub timeout: Duration,
    /// Evaluate the condition right away instead of after the first interval
    pub immediate: bool,
}

impl PollConfig {
    /// Waiting for a repository lock held by another process: every 10s, up to 1h.
    pub fn lock_wait() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60 * 60),
            immediate: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("condition not met within {0:?}")]
    TimedOut(Duration),

    #[error("polling cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(E),
}

/// Evaluates `condition` until it returns `Ok(true)`.
///
/// An `Err` from the condition stops polling immediately.
pub async fn poll_until<F, Fut, E>(
    config: &PollConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut condition: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut next = if config.immediate {
        start
    } else {
        start + config.interval
    };
    let mut attempt: u32 = 0;

    loop {
        if next > deadline {
            debug!(operation = operation_name, attempts = attempt, "polling timed out");
            return Err(PollError::TimedOut(config.timeout));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = sleep_until(next) => {}
        }

        attempt += 1;
        if condition().await.map_err(PollError::Failed)? {
            debug!(
                operation = operation_name,
                attempts = attempt,
                elapsed_ms = start.elapsed().as_millis(),
                "condition met"
            );
            return Ok(());
        }
        next = Instant::now() + config.interval;
    }
}
