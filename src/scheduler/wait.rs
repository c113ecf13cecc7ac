//! Timeout-bounded waits on device state.
//!
//! Built on `tokio::time`, so tests drive them with a paused clock instead
//! of real hardware delays.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// How a bounded wait ended without success.
#[derive(Debug)]
pub enum WaitError<E> {
    /// The condition never held; carries the time waited.
    TimedOut(Duration),
    /// The probe itself failed.
    Failed(E),
}

/// Poll a condition at a fixed interval until it holds or time runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Delay between probes.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Overall limit for one wait.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl WaitPolicy {
    /// Policy probing every `poll_interval` for at most `timeout`.
    pub const fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Probe until it yields `true`.
    ///
    /// The first probe runs immediately. The probe is always tried once more
    /// at the deadline, so a condition that becomes true exactly at the limit
    /// still counts.
    pub async fn wait_until<F, Fut, E>(&self, mut probe: F) -> Result<(), WaitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let started = Instant::now();
        loop {
            if probe().await.map_err(WaitError::Failed)? {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(WaitError::TimedOut(elapsed));
            }
            tokio::time::sleep(self.poll_interval.min(self.timeout - elapsed)).await;
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_secs(5))
    }
}

/// All waits a scan session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicies {
    /// Digitizer completion polling.
    pub acquisition: WaitPolicy,
    /// Limit on one positioner task's `wait_until_done`.
    #[serde(with = "humantime_serde")]
    pub positioner_timeout: Duration,
    /// Limit on one digitizer fetch.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Retries after the first timed-out acquisition.
    pub max_acquisition_retries: u32,
}

impl Default for WaitPolicies {
    fn default() -> Self {
        Self {
            acquisition: WaitPolicy::default(),
            positioner_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(5),
            max_acquisition_retries: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_condition_holds() {
        let policy = WaitPolicy::new(Duration::from_millis(5), Duration::from_secs(1));
        let mut polls = 0;
        let result = policy
            .wait_until(|| {
                polls += 1;
                let done = polls >= 4;
                async move { Ok::<_, Infallible>(done) }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_the_limit() {
        let policy = WaitPolicy::new(Duration::from_millis(30), Duration::from_millis(100));
        let started = Instant::now();
        let result = policy
            .wait_until(|| async { Ok::<_, Infallible>(false) })
            .await;
        assert!(matches!(
            result,
            Err(WaitError::TimedOut(waited))
                if waited >= Duration::from_millis(100) && waited < Duration::from_millis(110)
        ));
        assert!(started.elapsed() < Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_between_probes() {
        use tokio_test::{assert_pending, assert_ready, task};

        let policy = WaitPolicy::new(Duration::from_millis(50), Duration::from_millis(100));
        let mut wait = task::spawn(policy.wait_until(|| async { Ok::<_, Infallible>(false) }));
        assert_pending!(wait.poll());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_pending!(wait.poll());

        tokio::time::advance(Duration::from_millis(50)).await;
        let result = assert_ready!(wait.poll());
        assert!(matches!(result, Err(WaitError::TimedOut(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_are_passed_through() {
        let policy = WaitPolicy::default();
        let result = policy.wait_until(|| async { Err::<bool, _>("bus fault") }).await;
        assert!(matches!(result, Err(WaitError::Failed("bus fault"))));
    }
}
