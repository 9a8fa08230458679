//! Reconnect retry policies.

use std::time::Duration;

use crate::HubError;

/// Inputs to a retry decision.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Reconnect attempts that have already failed. Zero for the decision
    /// made immediately after the connection was lost.
    pub previous_retry_count: u32,
    /// Wall-clock time spent reconnecting so far.
    pub elapsed: Duration,
    /// The error that caused the current reconnect round: the original
    /// disconnect reason first, then each failed attempt's error.
    pub retry_reason: HubError,
}

/// Decides whether and when the next reconnect attempt happens.
pub trait RetryPolicy: Send + Sync + 'static {
    /// Delay before the next attempt, or `None` to give up.
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(&RetryContext) -> Option<Duration> + Send + Sync + 'static,
{
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self(context)
    }
}

/// The stock reconnect ladder: four attempts at fixed delays, then give up.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    delays: Vec<Duration>,
}

impl DefaultRetryPolicy {
    /// Retry after each of the given delays, in order, then give up.
    pub fn with_delays(delays: Vec<Duration>) -> Self {
        Self { delays }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
        }
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self.delays.get(context.previous_retry_count as usize).copied()
    }
}
