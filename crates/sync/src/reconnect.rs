//! Fixed-delay reconnection for push channels.
//!
//! When a push channel drops, the client calls [`reconnect_loop`], which
//! waits [`ReconnectConfig::delay`] before each attempt and gives up after
//! [`ReconnectConfig::max_attempts`] consecutive failures. The attempt
//! count starts from zero for every outage.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use trapick_core::types::JobId;

use crate::client::{PushConnector, PushStream};

/// Tunable parameters for the reconnect strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Wait before every attempt, including the first.
    pub delay: Duration,
    /// Attempts per outage before the client gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

/// How a reconnect loop ended.
pub enum ReconnectOutcome {
    Connected(PushStream),
    /// `max_attempts` consecutive attempts failed.
    Exhausted,
    Cancelled,
}

impl fmt::Debug for ReconnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectOutcome::Connected(_) => f.write_str("Connected(..)"),
            ReconnectOutcome::Exhausted => f.write_str("Exhausted"),
            ReconnectOutcome::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Attempt to reconnect the push channel for `job_id`.
///
/// Sleeps `config.delay` before each attempt. Returns as soon as an
/// attempt succeeds, the budget is spent, or `cancel` fires.
pub async fn reconnect_loop(
    connector: &dyn PushConnector,
    job_id: &JobId,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> ReconnectOutcome {
    for attempt in 1..=config.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job_id, "Reconnect cancelled");
                return ReconnectOutcome::Cancelled;
            }
            _ = tokio::time::sleep(config.delay) => {}
        }

        tracing::info!(
            job_id = %job_id,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = config.delay.as_millis() as u64,
            "Reconnecting push channel",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job_id, "Reconnect cancelled");
                return ReconnectOutcome::Cancelled;
            }
            result = connector.connect(job_id) => {
                match result {
                    Ok(stream) => {
                        tracing::info!(job_id = %job_id, attempt, "Push channel reconnected");
                        return ReconnectOutcome::Connected(stream);
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %job_id,
                            error = %e,
                            "Reconnect attempt {attempt}/{} failed",
                            config.max_attempts,
                        );
                    }
                }
            }
        }
    }

    tracing::warn!(
        job_id = %job_id,
        attempts = config.max_attempts,
        "Push channel reconnect budget exhausted",
    );
    ReconnectOutcome::Exhausted
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use tokio::time::Instant;

    use super::*;
    use crate::client::PushClientError;

    /// Fails every attempt until `succeed_on`, recording attempt times.
    struct ScriptedConnector {
        succeed_on: Option<usize>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnector {
        fn new(succeed_on: Option<usize>) -> Self {
            Self {
                succeed_on,
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempt_times(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushConnector for ScriptedConnector {
        async fn connect(&self, _job_id: &JobId) -> Result<PushStream, PushClientError> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            if Some(attempts.len()) == self.succeed_on {
                Ok(stream::empty().boxed())
            } else {
                Err(PushClientError::Connection("refused".into()))
            }
        }
    }

    #[test]
    fn default_is_five_attempts_three_seconds_apart() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts_at_fixed_spacing() {
        let connector = ScriptedConnector::new(None);
        let start = Instant::now();

        let outcome = reconnect_loop(
            &connector,
            &JobId::from("job-1"),
            &ReconnectConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_matches!(outcome, ReconnectOutcome::Exhausted);
        let times = connector.attempt_times();
        assert_eq!(times.len(), 5);
        let mut previous = start;
        for t in times {
            let gap = t - previous;
            assert!(
                gap >= Duration::from_secs(3) && gap < Duration::from_millis(3_010),
                "gap {gap:?}"
            );
            previous = t;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_success() {
        let connector = Arc::new(ScriptedConnector::new(Some(3)));

        let outcome = reconnect_loop(
            connector.as_ref(),
            &JobId::from("job-1"),
            &ReconnectConfig::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_matches!(outcome, ReconnectOutcome::Connected(_));
        assert_eq!(connector.attempt_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_reconnect() {
        let connector = ScriptedConnector::new(None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = reconnect_loop(
            &connector,
            &JobId::from("job-1"),
            &ReconnectConfig::default(),
            &cancel,
        )
        .await;

        assert_matches!(outcome, ReconnectOutcome::Cancelled);
        assert!(connector.attempt_times().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_exhausts_immediately() {
        let connector = ScriptedConnector::new(None);
        let config = ReconnectConfig {
            max_attempts: 0,
            ..Default::default()
        };

        let outcome =
            reconnect_loop(&connector, &JobId::from("job-1"), &config, &CancellationToken::new())
                .await;

        assert_matches!(outcome, ReconnectOutcome::Exhausted);
        assert!(connector.attempt_times().is_empty());
    }
}
