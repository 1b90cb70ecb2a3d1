//! In-memory transports for driving the coordinator in tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore};
use trapick_core::job::JobStatus;
use trapick_core::types::JobId;
use trapick_sync::api::{PolledStatus, StatusApiError, StatusFetcher};
use trapick_sync::client::{PushClientError, PushConnector, PushFrame, PushStream};
use trapick_sync::coordinator::TrackCallbacks;

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Hands out one queued session per connect and refuses once the queue
/// is empty.
#[derive(Default)]
pub struct FakeConnector {
    sessions: Mutex<VecDeque<mpsc::UnboundedReceiver<PushFrame>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    /// A connector that refuses every connection.
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a session. Frames sent on the returned handle are delivered
    /// while it is alive; dropping it ends the session.
    pub fn session(&self) -> mpsc::UnboundedSender<PushFrame> {
        let (tx, rx) = mpsc::unbounded();
        self.sessions.lock().unwrap().push_back(rx);
        tx
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, _job_id: &JobId) -> Result<PushStream, PushClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(rx) => Ok(rx.map(Ok::<PushFrame, PushClientError>).boxed()),
            None => Err(PushClientError::Connection("connection refused".into())),
        }
    }
}

pub fn progress(percent: u8, message: &str) -> PushFrame {
    PushFrame::Text(format!(
        r#"{{"type":"progress_update","progress":{percent},"message":"{message}"}}"#
    ))
}

pub fn complete(job_id: &str) -> PushFrame {
    PushFrame::Text(format!(
        r#"{{"type":"processing_complete","video_id":"{job_id}","message":"Processing completed!"}}"#
    ))
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// Serves statuses from a map. With a gate, every request waits for a
/// permit before answering.
#[derive(Default)]
pub struct FakeFetcher {
    statuses: Mutex<HashMap<JobId, String>>,
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    pub started: Notify,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fetcher whose requests block until `gate` hands out a permit.
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn set_status(&self, job_id: &str, status: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(JobId::from(job_id), status.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusFetcher for FakeFetcher {
    async fn fetch_statuses(&self, ids: &[JobId]) -> Result<Vec<PolledStatus>, StatusApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let statuses = self.statuses.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                statuses.get(id).map(|s| PolledStatus {
                    id: id.clone(),
                    processing_status: s.clone(),
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Records every callback invocation.
#[derive(Default)]
pub struct Recorder {
    pub updates: Mutex<Vec<JobStatus>>,
    pub terminals: Mutex<Vec<JobStatus>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn callbacks(self: &Arc<Self>) -> TrackCallbacks {
        let on_update = Arc::clone(self);
        let on_terminal = Arc::clone(self);
        TrackCallbacks::new()
            .on_update(move |s| on_update.updates.lock().unwrap().push(s.clone()))
            .on_terminal(move |s| on_terminal.terminals.lock().unwrap().push(s.clone()))
    }

    pub fn percents(&self) -> Vec<u8> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.percent_complete)
            .collect()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.lock().unwrap().len()
    }
}

/// Let spawned tasks run without reaching the next poll tick.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
