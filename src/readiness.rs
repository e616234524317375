//! Bounded polling for machine readiness and SSH reachability.
//!
//! Each attempt waits one interval and then queries once, so a budget of
//! `n` attempts issues exactly `n` queries. A failed query ends the wait
//! immediately; only "not ready yet" answers consume the budget.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Interval and attempt budget for a polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay before each query.
    pub interval: Duration,
    /// Number of queries allowed before giving up.
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Machine initialisation: every 2s for up to 150 attempts (~5 minutes).
    pub const MACHINE_READINESS: Self = Self::new(Duration::from_secs(2), 150);

    /// SSH reachability after the machine reports ready: every 2s, 15 tries.
    pub const REACHABILITY: Self = Self::new(Duration::from_secs(2), 15);

    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Answer from one status query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// The resource is usable.
    Ready,
    /// Not ready yet; keep polling.
    Pending,
    /// The resource reached a state it will not recover from.
    Failed(String),
}

/// Errors ending a polling loop without readiness.
#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + 'static,
{
    /// The attempt budget was exhausted.
    #[error("not ready after {attempts} attempts")]
    Timeout {
        /// Queries issued.
        attempts: u32,
    },
    /// A status query failed.
    #[error("status query failed: {0}")]
    Status(#[source] E),
    /// The resource entered a terminal state.
    #[error("resource entered terminal state {0}")]
    Failed(String),
}

/// Polls `query` under `policy` until it reports [`Readiness::Ready`].
///
/// Returns the number of queries issued.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] after `policy.max_attempts` pending
/// answers, [`PollError::Status`] as soon as a query fails, and
/// [`PollError::Failed`] for a terminal state.
pub async fn wait_until_ready<F, Fut, E>(policy: PollPolicy, mut query: F) -> Result<u32, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Readiness, E>>,
    E: std::error::Error + 'static,
{
    for attempt in 1..=policy.max_attempts {
        sleep(policy.interval).await;
        match query().await.map_err(PollError::Status)? {
            Readiness::Ready => {
                debug!(attempt, "ready");
                return Ok(attempt);
            }
            Readiness::Pending => debug!(attempt, max = policy.max_attempts, "not ready yet"),
            Readiness::Failed(state) => return Err(PollError::Failed(state)),
        }
    }

    Err(PollError::Timeout {
        attempts: policy.max_attempts,
    })
}
