//! Fixed-interval polling with a hard ceiling on the number of waits.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

/// How often to poll, and how many times to sleep before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_waits: u32,
}

impl Default for PollPolicy {
    /// 30 waits of 10 seconds: about five minutes.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_waits: 30,
        }
    }
}

impl PollPolicy {
    /// Longest time a poll can take, not counting the checks themselves.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_waits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
}

/// Call `check` until it reports ready or the policy runs out.
///
/// A check that is ready right away returns without sleeping. Errors from
/// `check` are returned as-is; the caller decides what they mean.
pub async fn poll_until<F, Fut>(
    policy: PollPolicy,
    what: &str,
    mut check: F,
) -> Result<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut waits = 0u32;
    loop {
        if check().await? {
            debug!(resource = %what, waits, "ready");
            return Ok(PollOutcome::Ready);
        }
        if waits >= policy.max_waits {
            return Ok(PollOutcome::TimedOut);
        }
        info!(resource = %what, attempt = waits + 1, "waiting");
        tokio::time::sleep(policy.interval).await;
        waits += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately_does_not_sleep() {
        let start = Instant::now();
        let outcome = poll_until(PollPolicy::default(), "vol-1", || async {
            Ok::<_, anyhow::Error>(true)
        })
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_retries() {
        let calls = Cell::new(0);
        let start = Instant::now();
        let outcome = poll_until(PollPolicy::default(), "i-1", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { Ok::<_, anyhow::Error>(n >= 3) }
        })
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(calls.get(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_ceiling() {
        let calls = Cell::new(0u32);
        let start = Instant::now();
        let outcome = poll_until(PollPolicy::default(), "i-1", || {
            calls.set(calls.get() + 1);
            async { Ok::<_, anyhow::Error>(false) }
        })
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(calls.get(), 31);
        assert_eq!(start.elapsed(), PollPolicy::default().ceiling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_propagates() {
        let result = poll_until(PollPolicy::default(), "vol-1", || async {
            Err::<bool, _>(anyhow::anyhow!("throttled"))
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("throttled"));
    }
}
