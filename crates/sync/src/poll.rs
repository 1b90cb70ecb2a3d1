//! Poll fallback source.
//!
//! [`PollSource`] periodically asks the status endpoint about every
//! enrolled, non-terminal job and forwards the results through the same
//! ingest path the push client uses. Each job is polled according to its
//! [`PollMode`]:
//!
//! | Mode        | Polled                                   |
//! |-------------|------------------------------------------|
//! | `Suspended` | never                                    |
//! | `SafetyNet` | every `safety_net_interval` (default 10s)|
//! | `Active`    | every `active_interval` (default 5s)     |
//!
//! The store is consulted before every request, so a job stops being
//! polled as soon as it is terminal. Failed or timed-out requests are
//! logged and never touch job state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use trapick_core::job::JobUpdate;
use trapick_core::processing_status::phase_for_processing_status;
use trapick_core::types::JobId;

use crate::api::StatusFetcher;
use crate::store::{JobStore, ReceiptCounter, UpdateSink};

/// Poll timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Interval for jobs whose push channel is gone.
    pub active_interval: Duration,
    /// Interval for the low-frequency check while push is healthy.
    pub safety_net_interval: Duration,
    /// Upper bound on one status request.
    pub request_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(5),
            safety_net_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl PollConfig {
    /// How often the loop wakes up to look for due jobs.
    pub fn tick(&self) -> Duration {
        self.active_interval.min(self.safety_net_interval)
    }
}

/// How often a single job is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollMode {
    Suspended,
    SafetyNet,
    Active,
}

struct Enrollment {
    mode: PollMode,
    /// Where results for this job go. The coordinator supplies a sink
    /// that drops results once the job is no longer tracked.
    sink: Arc<dyn UpdateSink>,
    last_polled: Option<Instant>,
}

pub struct PollSource {
    store: Arc<JobStore>,
    fetcher: Arc<dyn StatusFetcher>,
    config: PollConfig,
    enrolled: Mutex<HashMap<JobId, Enrollment>>,
    receipts: ReceiptCounter,
}

impl PollSource {
    pub fn new(store: Arc<JobStore>, fetcher: Arc<dyn StatusFetcher>, config: PollConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
            enrolled: Mutex::new(HashMap::new()),
            receipts: ReceiptCounter::default(),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Enroll `job_id`, replacing any previous enrollment.
    pub fn enroll(&self, job_id: JobId, mode: PollMode, sink: Arc<dyn UpdateSink>) {
        tracing::debug!(job_id = %job_id, ?mode, "Enrolled job for polling");
        self.enrolled().insert(
            job_id,
            Enrollment {
                mode,
                sink,
                last_polled: None,
            },
        );
    }

    /// Change how often `job_id` is polled. Returns `false` if the job is
    /// not enrolled.
    pub fn set_mode(&self, job_id: &JobId, mode: PollMode) -> bool {
        let mut enrolled = self.enrolled();
        let Some(enrollment) = enrolled.get_mut(job_id) else {
            return false;
        };
        if enrollment.mode != mode {
            tracing::info!(job_id = %job_id, from = ?enrollment.mode, to = ?mode, "Poll mode changed");
            enrollment.mode = mode;
        }
        true
    }

    pub fn unenroll(&self, job_id: &JobId) -> bool {
        let removed = self.enrolled().remove(job_id).is_some();
        if removed {
            tracing::debug!(job_id = %job_id, "Unenrolled job from polling");
        }
        removed
    }

    /// Unenroll `job_id` only if it is still enrolled with `sink`.
    pub fn unenroll_sink(&self, job_id: &JobId, sink: &Arc<dyn UpdateSink>) -> bool {
        let mut enrolled = self.enrolled();
        let owned = enrolled
            .get(job_id)
            .is_some_and(|e| Arc::ptr_eq(&e.sink, sink));
        if owned {
            enrolled.remove(job_id);
            tracing::debug!(job_id = %job_id, "Unenrolled job from polling");
        }
        owned
    }

    pub fn mode(&self, job_id: &JobId) -> Option<PollMode> {
        self.enrolled().get(job_id).map(|e| e.mode)
    }

    pub fn enrolled_jobs(&self) -> Vec<JobId> {
        self.enrolled().keys().cloned().collect()
    }

    /// Poll on every tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            active_secs = self.config.active_interval.as_secs(),
            safety_net_secs = self.config.safety_net_interval.as_secs(),
            "Poll source started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Poll source stopping");
                    break;
                }
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Poll source stopping mid-request");
                    break;
                }
                _ = self.poll_once() => {}
            }
        }
    }

    /// Issue one status request for every job that is due.
    ///
    /// Returns the number of results forwarded.
    pub async fn poll_once(&self) -> usize {
        let ids = self.due_jobs(Instant::now());
        if ids.is_empty() {
            return 0;
        }

        let receipt = self.receipts.next();
        tracing::debug!(jobs = ids.len(), receipt, "Polling job statuses");

        let result =
            tokio::time::timeout(self.config.request_timeout, self.fetcher.fetch_statuses(&ids))
                .await;

        let statuses = match result {
            Ok(Ok(statuses)) => statuses,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, jobs = ids.len(), "Status poll failed");
                return 0;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.request_timeout.as_secs(),
                    jobs = ids.len(),
                    "Status poll timed out",
                );
                return 0;
            }
        };

        let mut forwarded = 0;
        for polled in statuses {
            let phase = match phase_for_processing_status(&polled.processing_status) {
                Ok(phase) => phase,
                Err(e) => {
                    tracing::warn!(job_id = %polled.id, error = %e, "Dropping poll result");
                    continue;
                }
            };

            // The job may have been unenrolled while the request was in flight.
            let sink = self.enrolled().get(&polled.id).map(|e| Arc::clone(&e.sink));
            let Some(sink) = sink else {
                tracing::debug!(job_id = %polled.id, "Discarding poll result for unenrolled job");
                continue;
            };

            sink.deliver(JobUpdate::polled(polled.id, receipt, phase));
            forwarded += 1;
        }
        forwarded
    }

    // ---- private helpers ----

    /// Ids due for polling at `now`; marks them as polled.
    fn due_jobs(&self, now: Instant) -> Vec<JobId> {
        let mut enrolled = self.enrolled();
        let mut due = Vec::new();
        for (job_id, enrollment) in enrolled.iter_mut() {
            let is_due = match enrollment.mode {
                PollMode::Suspended => false,
                PollMode::Active => true,
                PollMode::SafetyNet => enrollment.last_polled.map_or(true, |last| {
                    now.duration_since(last) >= self.config.safety_net_interval
                }),
            };
            if !is_due || self.store.is_terminal(job_id) {
                continue;
            }
            enrollment.last_polled = Some(now);
            due.push(job_id.clone());
        }
        due.sort();
        due
    }

    fn enrolled(&self) -> MutexGuard<'_, HashMap<JobId, Enrollment>> {
        self.enrolled.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Poll enrollment lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
