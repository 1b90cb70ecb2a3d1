//! Command-line watcher built on `trapick-sync`.
//!
//! Tracks a fixed set of jobs until every one of them reaches a terminal
//! phase, logging each reconciled update along the way.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use trapick_core::job::JobStatus;
use trapick_core::types::JobId;
use trapick_sync::coordinator::{Subscription, SyncCoordinator, TrackCallbacks};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatchArgsError {
    #[error("TRACK_JOB_IDS environment variable is required")]
    Missing,
    #[error("TRACK_JOB_IDS contains no job ids")]
    Empty,
}

/// Parse a comma-separated id list, dropping blanks and duplicates while
/// keeping first-seen order.
pub fn parse_job_ids(raw: Option<&str>) -> Result<Vec<JobId>, WatchArgsError> {
    let raw = raw.ok_or(WatchArgsError::Missing)?;
    let mut seen = HashSet::new();
    let ids: Vec<JobId> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(JobId::from)
        .collect();
    if ids.is_empty() {
        return Err(WatchArgsError::Empty);
    }
    Ok(ids)
}

/// Counts down outstanding jobs and wakes the waiter when none are left.
#[derive(Debug)]
pub struct Completion {
    remaining: Mutex<HashSet<JobId>>,
    done: Notify,
}

impl Completion {
    pub fn new(ids: &[JobId]) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(ids.iter().cloned().collect()),
            done: Notify::new(),
        })
    }

    /// Mark `job_id` finished. Returns the number still outstanding.
    pub fn finish(&self, job_id: &JobId) -> usize {
        let mut remaining = self.remaining.lock().unwrap_or_else(|p| p.into_inner());
        remaining.remove(job_id);
        let left = remaining.len();
        if left == 0 {
            self.done.notify_one();
        }
        left
    }

    pub fn remaining(&self) -> usize {
        self.remaining.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Resolve once every job has finished.
    pub async fn wait(&self) {
        if self.remaining() == 0 {
            return;
        }
        self.done.notified().await;
    }
}

/// Process exit status: `0` only when no job was left unfinished.
pub fn exit_code(outstanding: usize) -> u8 {
    if outstanding == 0 {
        0
    } else {
        1
    }
}

fn log_update(status: &JobStatus) {
    tracing::info!(
        job_id = %status.job_id,
        phase = %status.phase,
        percent = status.percent_complete,
        message = %status.message,
        "Job update",
    );
}

/// Track every id in `ids`, reporting completion through `completion`.
///
/// The returned subscriptions must be held for as long as tracking
/// should continue.
pub fn track_all(
    coordinator: &Arc<SyncCoordinator>,
    ids: &[JobId],
    completion: &Arc<Completion>,
) -> Vec<Subscription> {
    ids.iter()
        .map(|job_id| {
            let completion = Arc::clone(completion);
            let callbacks = TrackCallbacks::new()
                .on_update(log_update)
                .on_terminal(move |status| {
                    let left = completion.finish(&status.job_id);
                    tracing::info!(
                        job_id = %status.job_id,
                        phase = %status.phase,
                        remaining = left,
                        "Job finished",
                    );
                });
            coordinator.track(job_id.clone(), callbacks)
        })
        .collect()
}
