use crate::{metrics::EngineMetrics, Error};
use rand::Rng;
use std::future::Future;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff for load balancer operations.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,

    /// Retries stop once the next attempt would start after this much time
    /// has passed since the first.
    pub max_elapsed: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

// === impl Backoff ===

impl Backoff {
    /// The delay before the attempt following `delay`, before jitter.
    fn next(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Jitters a delay to between half and one and a half times its length.
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Runs `operation` until it succeeds, the backoff is exhausted, or
/// `shutdown` is signaled. Cancellation interrupts both an in-flight attempt
/// and the wait between attempts.
pub(crate) async fn retry<T, F, Fut>(
    backoff: &Backoff,
    op: &'static str,
    id: &str,
    shutdown: &CancellationToken,
    metrics: &EngineMetrics,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let start = Instant::now();
    let mut delay = backoff.initial;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
            res = operation() => res,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let wait = jitter(delay);
        let elapsed = start.elapsed();
        if elapsed + wait > backoff.max_elapsed {
            warn!(%op, %id, attempts, ?elapsed, %error, "Giving up");
            return Err(Error::Exhausted {
                op,
                id: id.to_string(),
                attempts,
                source: error.into(),
            });
        }

        debug!(%op, %id, attempts, ?wait, %error, "Retrying");
        metrics.retried(op);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
            _ = time::sleep(wait) => {}
        }
        delay = backoff.next(delay);
    }
}
