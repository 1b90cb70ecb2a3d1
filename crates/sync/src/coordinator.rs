//! Per-job synchronization coordinator.
//!
//! [`SyncCoordinator`] owns the lifecycle of every tracked job. For each
//! [`track`](SyncCoordinator::track) call it opens a [`PushClient`],
//! enrolls the job with the shared [`PollSource`] and spawns a small
//! supervisor task that turns push lifecycle events into state changes:
//!
//! ```text
//! Starting ──open──▶ PushActive ──exhausted──▶ PollOnly
//!     └──────────────exhausted─────────────────▲
//! any ──terminal status in store──▶ Terminal
//! ```
//!
//! Updates from both sources pass through a [`LiveSink`] whose liveness
//! check runs under the store's per-job gate, and ending a session waits
//! for that gate. Responses that arrive after an unsubscribe therefore
//! never reach the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trapick_core::job::{JobStatus, JobUpdate};
use trapick_core::types::{JobId, Timestamp};

use crate::api::{StatusApi, StatusApiError, StatusFetcher, UploadReceipt, UploadReceiptError};
use crate::client::{ConnectionState, PushClient, PushConnector, WsConnector};
use crate::config::SyncConfig;
use crate::events::PushEvent;
use crate::poll::{PollMode, PollSource};
use crate::store::{
    IngestOutcome, JobStore, ReceiptCounter, StatusCallback, SubscriptionId, UpdateSink,
};

/// How long shutdown waits for each background task.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of one tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Push client opening; polling not yet active.
    Starting,
    /// Push channel open; polling limited to the safety net.
    PushActive,
    /// Push channel gave up; polling at the active interval.
    PollOnly,
    /// Job reached a terminal phase; both sources torn down.
    Terminal,
}

/// Callbacks supplied to [`SyncCoordinator::track`].
///
/// `on_update` fires for every accepted update, the terminal one
/// included. `on_terminal` fires once, after `on_update`, when the job
/// completes or fails.
#[derive(Clone, Default)]
pub struct TrackCallbacks {
    on_update: Option<StatusCallback>,
    on_terminal: Option<StatusCallback>,
}

impl TrackCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update(mut self, f: impl Fn(&JobStatus) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_terminal(mut self, f: impl Fn(&JobStatus) + Send + Sync + 'static) -> Self {
        self.on_terminal = Some(Arc::new(f));
        self
    }

    fn update(&self, status: &JobStatus) {
        if let Some(f) = &self.on_update {
            f(status);
        }
    }

    fn terminal(&self, status: &JobStatus) {
        if let Some(f) = &self.on_terminal {
            f(status);
        }
    }
}

/// Snapshot of one tracked job for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJobInfo {
    pub job_id: JobId,
    pub sync_state: SyncState,
    pub push_state: ConnectionState,
    pub poll_mode: Option<PollMode>,
    pub last_push_message_at: Option<Timestamp>,
}

/// Liveness and state of one tracking session.
///
/// A new session (new generation) is created every time a job is
/// tracked, so stale handles from an earlier session never affect it.
struct JobLink {
    job_id: JobId,
    generation: u64,
    state: Mutex<SyncState>,
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl JobLink {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn state(&self) -> SyncState {
        *lock(&self.state)
    }

    /// Move to `next` unless already terminal. Returns `true` on change.
    fn advance(&self, next: SyncState) -> bool {
        let mut state = lock(&self.state);
        if *state == SyncState::Terminal || *state == next {
            return false;
        }
        tracing::info!(
            job_id = %self.job_id,
            from = ?*state,
            to = ?next,
            "Sync state changed",
        );
        *state = next;
        true
    }
}

/// Sink used by both sources for one tracking session.
struct LiveSink {
    link: Arc<JobLink>,
    store: Arc<JobStore>,
}

impl UpdateSink for LiveSink {
    fn deliver(&self, update: JobUpdate) {
        let job_id = update.job_id.clone();
        let source = update.source;
        let outcome = self.store.ingest_if(update, || self.link.is_alive());
        if outcome == IngestOutcome::Withdrawn {
            tracing::debug!(
                job_id = %job_id,
                source = %source,
                "Discarding update for untracked job",
            );
        }
    }
}

/// Internal bookkeeping for a single tracked job.
struct TrackedJob {
    link: Arc<JobLink>,
    push: Arc<PushClient>,
    /// Sink this session enrolled with the poll source.
    sink: Arc<dyn UpdateSink>,
    subscription: SubscriptionId,
    supervisor: JoinHandle<()>,
}

/// Coordinates push and poll sources for every tracked job.
///
/// Created once via [`SyncCoordinator::start`]. The returned `Arc` can be
/// cloned freely.
pub struct SyncCoordinator {
    store: Arc<JobStore>,
    poller: Arc<PollSource>,
    connector: Arc<dyn PushConnector>,
    push_receipts: Arc<ReceiptCounter>,
    config: SyncConfig,
    /// Active tracking sessions indexed by job id.
    jobs: RwLock<HashMap<JobId, TrackedJob>>,
    next_generation: AtomicU64,
    /// Master cancellation token, cancelled during shutdown.
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Create the coordinator and start the poll loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        store: Arc<JobStore>,
        connector: Arc<dyn PushConnector>,
        fetcher: Arc<dyn StatusFetcher>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let poller = Arc::new(PollSource::new(Arc::clone(&store), fetcher, config.poll));
        let cancel = CancellationToken::new();

        let poll_task = tokio::spawn({
            let poller = Arc::clone(&poller);
            let cancel = cancel.child_token();
            async move { poller.run(cancel).await }
        });

        Arc::new(Self {
            store,
            poller,
            connector,
            push_receipts: Arc::new(ReceiptCounter::default()),
            config,
            jobs: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            cancel,
            poll_task: Mutex::new(Some(poll_task)),
        })
    }

    /// Create a coordinator that talks to the backend described by `config`.
    pub fn from_config(config: SyncConfig) -> Result<Arc<Self>, StatusApiError> {
        let fetcher = StatusApi::new(config.api_url.clone(), config.poll.request_timeout)?;
        let connector = WsConnector::new(config.ws_url.clone());
        Ok(Self::start(
            Arc::new(JobStore::new()),
            Arc::new(connector),
            Arc::new(fetcher),
            config,
        ))
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Current reconciled status of `job_id`.
    pub fn get(&self, job_id: &JobId) -> Option<JobStatus> {
        self.store.get(job_id)
    }

    /// Start tracking `job_id`.
    ///
    /// Tracking a job that is already tracked replaces the earlier
    /// session; its [`Subscription`] becomes inert. Tracking a job whose
    /// record is already terminal calls `on_terminal` immediately and
    /// opens nothing.
    pub fn track(self: &Arc<Self>, job_id: JobId, callbacks: TrackCallbacks) -> Subscription {
        let current = self.store.track(&job_id);
        if current.is_terminal() {
            tracing::info!(
                job_id = %job_id,
                phase = %current.phase,
                "Job already terminal, nothing to track",
            );
            callbacks.terminal(&current);
            return Subscription {
                job_id,
                link: None,
                coordinator: Weak::new(),
            };
        }

        if let Some(previous) = self.remove_entry(&job_id, None) {
            tracing::info!(job_id = %job_id, "Replacing existing tracking session");
            previous.link.alive.store(false, Ordering::SeqCst);
            previous.link.cancel.cancel();
            self.release_sources(&previous);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(JobLink {
            job_id: job_id.clone(),
            generation,
            state: Mutex::new(SyncState::Starting),
            alive: AtomicBool::new(true),
            cancel: self.cancel.child_token(),
        });

        let subscription = self.store.on_change(
            &job_id,
            status_callback(Arc::clone(&link), callbacks, Arc::downgrade(self)),
        );

        let sink: Arc<dyn UpdateSink> = Arc::new(LiveSink {
            link: Arc::clone(&link),
            store: Arc::clone(&self.store),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let push = Arc::new(PushClient::open(
            job_id.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&sink),
            Arc::clone(&self.push_receipts),
            self.config.reconnect,
            event_tx,
        ));

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&link),
            Arc::clone(&self.poller),
            self.config.safety_net_poll,
            event_rx,
        ));

        tracing::info!(job_id = %job_id, generation, "Tracking job");
        let displaced = {
            // Enrolling under the map lock keeps the poll enrollment
            // paired with whichever session owns the entry.
            let mut jobs = write(&self.jobs);
            self.poller
                .enroll(job_id.clone(), PollMode::Suspended, Arc::clone(&sink));
            jobs.insert(
                job_id.clone(),
                TrackedJob {
                    link: Arc::clone(&link),
                    push,
                    sink,
                    subscription,
                    supervisor,
                },
            )
        };

        // A concurrent track of the same id lost the race. Its poll
        // enrollment was replaced by ours.
        if let Some(displaced) = displaced {
            displaced.link.alive.store(false, Ordering::SeqCst);
            displaced.link.cancel.cancel();
            displaced.push.close();
            self.store.remove_subscriber(&job_id, displaced.subscription);
        }

        // The job may have gone terminal before the entry was inserted.
        if !link.is_alive() {
            if let Some(entry) = self.remove_entry(&job_id, Some(generation)) {
                self.release_sources(&entry);
            }
        }

        Subscription {
            job_id,
            link: Some(link),
            coordinator: Arc::downgrade(self),
        }
    }

    /// Track the job created by a successful upload.
    pub fn track_upload(
        self: &Arc<Self>,
        receipt: &UploadReceipt,
        callbacks: TrackCallbacks,
    ) -> Result<Subscription, UploadReceiptError> {
        let job_id = receipt.job_id()?;
        Ok(self.track(job_id, callbacks))
    }

    /// Sync state of `job_id`, or `None` if it is neither tracked nor
    /// known to be terminal.
    pub fn sync_state(&self, job_id: &JobId) -> Option<SyncState> {
        if let Some(entry) = read(&self.jobs).get(job_id) {
            return Some(entry.link.state());
        }
        self.store
            .is_terminal(job_id)
            .then_some(SyncState::Terminal)
    }

    pub fn tracked_job(&self, job_id: &JobId) -> Option<TrackedJobInfo> {
        read(&self.jobs).get(job_id).map(|entry| self.info(entry))
    }

    /// Snapshots of every active tracking session, ordered by job id.
    pub fn tracked_jobs(&self) -> Vec<TrackedJobInfo> {
        let mut jobs: Vec<_> = read(&self.jobs).values().map(|e| self.info(e)).collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    /// Stop tracking `job_id` and drop its record from the store.
    pub fn release(&self, job_id: &JobId) -> Option<JobStatus> {
        if let Some(entry) = self.remove_entry(job_id, None) {
            entry.link.alive.store(false, Ordering::SeqCst);
            entry.link.cancel.cancel();
            self.release_sources(&entry);
        }
        self.store.release(job_id)
    }

    /// Gracefully shut down every tracking session and the poll loop.
    ///
    /// Cancels the master token, then waits up to 5 seconds per task
    /// for a clean exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sync coordinator");
        self.cancel.cancel();

        let entries: Vec<(JobId, TrackedJob)> = write(&self.jobs).drain().collect();
        for (job_id, entry) in entries {
            tracing::info!(job_id = %job_id, "Stopping job tracking");
            entry.link.alive.store(false, Ordering::SeqCst);
            self.release_sources(&entry);

            if let Some(task) = entry.push.take_task() {
                let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await;
            }
            let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, entry.supervisor).await;
        }

        let poll_task = lock(&self.poll_task).take();
        if let Some(task) = poll_task {
            let _ = tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await;
        }

        tracing::info!("Sync coordinator shut down complete");
    }

    // ---- private helpers ----

    /// End the session behind `link`: mark it dead and release its
    /// sources if it still owns the map entry.
    fn end_session(&self, link: &JobLink) {
        link.alive.store(false, Ordering::SeqCst);
        link.cancel.cancel();
        self.store.quiesce(&link.job_id);
        if let Some(entry) = self.remove_entry(&link.job_id, Some(link.generation)) {
            self.release_sources(&entry);
        }
    }

    /// Remove the map entry for `job_id`, optionally only if it belongs
    /// to `generation`.
    fn remove_entry(&self, job_id: &JobId, generation: Option<u64>) -> Option<TrackedJob> {
        let mut jobs = write(&self.jobs);
        match (jobs.get(job_id), generation) {
            (Some(entry), Some(g)) if entry.link.generation != g => None,
            (Some(_), _) => jobs.remove(job_id),
            (None, _) => None,
        }
    }

    /// Close the push client, stop polling and drop the store callback.
    /// The job's status record is kept.
    fn release_sources(&self, entry: &TrackedJob) {
        entry.push.close();
        self.poller.unenroll_sink(&entry.link.job_id, &entry.sink);
        self.store
            .remove_subscriber(&entry.link.job_id, entry.subscription);
    }

    fn info(&self, entry: &TrackedJob) -> TrackedJobInfo {
        TrackedJobInfo {
            job_id: entry.link.job_id.clone(),
            sync_state: entry.link.state(),
            push_state: entry.push.state(),
            poll_mode: self.poller.mode(&entry.link.job_id),
            last_push_message_at: entry.push.last_message_at(),
        }
    }
}

/// Store callback for one tracking session.
fn status_callback(
    link: Arc<JobLink>,
    callbacks: TrackCallbacks,
    coordinator: Weak<SyncCoordinator>,
) -> StatusCallback {
    Arc::new(move |status: &JobStatus| {
        if !link.is_alive() {
            return;
        }
        if !status.is_terminal() {
            callbacks.update(status);
            return;
        }

        link.advance(SyncState::Terminal);
        tracing::info!(
            job_id = %status.job_id,
            phase = %status.phase,
            "Job reached terminal phase",
        );
        callbacks.update(status);
        callbacks.terminal(status);

        match coordinator.upgrade() {
            Some(coordinator) => coordinator.end_session(&link),
            None => {
                link.alive.store(false, Ordering::SeqCst);
                link.cancel.cancel();
            }
        }
    })
}

/// Translate push lifecycle events into sync state and poll mode.
async fn supervise(
    link: Arc<JobLink>,
    poller: Arc<PollSource>,
    safety_net: bool,
    mut events: mpsc::UnboundedReceiver<PushEvent>,
) {
    let job_id = link.job_id.clone();
    loop {
        let event = tokio::select! {
            _ = link.cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(PushEvent::Connected { .. }) => {
                if link.advance(SyncState::PushActive) {
                    let mode = if safety_net {
                        PollMode::SafetyNet
                    } else {
                        PollMode::Suspended
                    };
                    poller.set_mode(&job_id, mode);
                }
            }
            Some(PushEvent::Disconnected { .. }) => {
                tracing::debug!(job_id = %job_id, "Push channel reconnecting");
            }
            Some(PushEvent::Exhausted { attempts, .. }) => {
                tracing::info!(job_id = %job_id, attempts, "Falling back to polling");
                if link.advance(SyncState::PollOnly) {
                    poller.set_mode(&job_id, PollMode::Active);
                }
            }
            None => {
                // The push client is finished; wait for teardown.
                link.cancel.cancelled().await;
                break;
            }
        }
    }
    tracing::debug!(job_id = %job_id, "Supervisor exited");
}

/// Handle returned by [`SyncCoordinator::track`].
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription stops tracking the job"]
pub struct Subscription {
    job_id: JobId,
    /// `None` when the job was already terminal at track time.
    link: Option<Arc<JobLink>>,
    coordinator: Weak<SyncCoordinator>,
}

impl Subscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// State of this tracking session.
    pub fn state(&self) -> SyncState {
        self.link
            .as_ref()
            .map_or(SyncState::Terminal, |link| link.state())
    }

    /// Whether this session still delivers updates.
    pub fn is_active(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_alive())
    }

    /// Stop tracking. Both sources are torn down before this returns,
    /// after any update already being applied for the job has finished.
    /// No callback fires and no source result reaches the store afterwards. The job's status record is kept, so
    /// tracking it again resumes from its history.
    ///
    /// Safe to call at any time and any number of times. A no-op once
    /// the job is terminal.
    pub fn unsubscribe(&self) {
        let Some(link) = &self.link else {
            return;
        };
        if !link.is_alive() || link.state() == SyncState::Terminal {
            return;
        }
        tracing::info!(job_id = %self.job_id, "Unsubscribed");
        match self.coordinator.upgrade() {
            Some(coordinator) => coordinator.end_session(link),
            None => {
                link.alive.store(false, Ordering::SeqCst);
                link.cancel.cancel();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("state", &self.state())
            .field("active", &self.is_active())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Coordinator mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!("Coordinator lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!("Coordinator lock poisoned, recovering");
        poisoned.into_inner()
    })
}
