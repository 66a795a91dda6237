//! Retry, timeout and polling wrappers for calls to external services

use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{Result, ThreadcastError};

/// Bounded retry with exponential backoff.
///
/// Only transient errors ([`ThreadcastError::is_transient`]) are retried;
/// a permanent error is returned on the attempt that produced it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "Transient error during {} (attempt {}/{}): {}. Retrying in {:?}...",
                        what, attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{} failed after {} attempts: {}", what, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Like [`RetryPolicy::run`], for operations that need `&mut` access to `state`
    pub async fn run_mut<S, T, F>(&self, what: &str, state: &mut S, mut op: F) -> Result<T>
    where
        S: ?Sized + Send,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(state).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "Transient error during {} (attempt {}/{}): {}. Retrying in {:?}...",
                        what, attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fail with [`ThreadcastError::Timeout`] if `fut` does not finish within `limit`
pub async fn with_timeout<T, Fut>(what: &str, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ThreadcastError::Timeout(format!(
            "{} did not complete within {:?}",
            what, limit
        ))),
    }
}

/// Outcome of one probe in [`poll_until`]
#[derive(Debug)]
pub enum PollStatus<T> {
    Ready(T),
    /// Not done yet; optionally the server's suggested delay before the next probe
    Pending(Option<Duration>),
    Failed(ThreadcastError),
}

/// Probe until ready, failed, or `timeout` has elapsed.
///
/// Sleeps `interval` between probes unless the probe suggests a delay.
/// Errors returned by the probe itself end the poll immediately.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut probes = 0u32;

    loop {
        probes += 1;
        let delay = match probe().await? {
            PollStatus::Ready(value) => {
                debug!("{} ready after {} probe(s)", what, probes);
                return Ok(value);
            }
            PollStatus::Failed(e) => return Err(e),
            PollStatus::Pending(suggested) => suggested.unwrap_or(interval),
        };

        let now = Instant::now();
        if now >= deadline || now + delay > deadline {
            return Err(ThreadcastError::Timeout(format!(
                "{} still pending after {:?} ({} probes)",
                what, timeout, probes
            )));
        }
        sleep(delay).await;
    }
}
