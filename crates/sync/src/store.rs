//! Job state store.
//!
//! [`JobStore`] is the single authority for mutating [`JobStatus`]
//! records. Both update sources feed [`JobStore::ingest`]; the UI reads
//! through [`JobStore::get`] and subscribes with [`JobStore::on_change`].
//!
//! Each job has its own slot with an ingest gate. Evaluation, mutation
//! and subscriber notification for one update happen while the gate is
//! held, so two updates for the same job never interleave. Reads only
//! take the record lock and never wait on a notification in progress.
//! Callbacks may read the store and may unsubscribe, but must not ingest
//! updates for the job that is notifying them.
//!
//! [`JobStore::ingest_if`] evaluates its admission check under the gate,
//! and [`JobStore::quiesce`] waits for the gate to be free. Together they
//! let a caller withdraw a source and know that nothing it admitted
//! earlier is still being applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, ThreadId};

use chrono::Utc;
use trapick_core::job::{JobStatus, JobUpdate, UpdateSource};
use trapick_core::reconcile::{reconcile, Decision, Supersession};
use trapick_core::types::JobId;

/// Callback invoked with the new status after each accepted update.
pub type StatusCallback = Arc<dyn Fn(&JobStatus) + Send + Sync>;

/// Handle returned by [`JobStore::on_change`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Result of ingesting one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The update was applied; carries the resulting status.
    Accepted(JobStatus),
    /// Identical to the current record; nothing changed.
    Duplicate,
    /// Lost against a newer or further-advanced record.
    Superseded(Supersession),
    /// The record is terminal; the update was discarded.
    Discarded,
    /// The admission check failed once the gate was held.
    Withdrawn,
    /// The update failed validation and never reached reconciliation.
    Rejected(String),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted(_))
    }
}

/// Source-side receipt sequence.
///
/// One counter is shared by every session of a source, so a new push
/// session for a job always numbers above the previous one.
#[derive(Debug, Default)]
pub struct ReceiptCounter(AtomicU64);

impl ReceiptCounter {
    /// Next receipt sequence. Starts at 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Anything that accepts raw updates from a source.
///
/// The store itself is a sink; the coordinator wraps it in a sink that
/// drops updates for jobs that are no longer tracked.
pub trait UpdateSink: Send + Sync {
    fn deliver(&self, update: JobUpdate);
}

/// In-process mapping from job id to reconciled status.
pub struct JobStore {
    slots: RwLock<HashMap<JobId, Arc<JobSlot>>>,
    next_subscription: AtomicU64,
}

struct JobSlot {
    gate: Mutex<()>,
    /// Thread currently holding `gate`, if any.
    holder: Mutex<Option<ThreadId>>,
    record: RwLock<JobRecord>,
    subscribers: Mutex<Vec<(SubscriptionId, StatusCallback)>>,
}

struct JobRecord {
    status: JobStatus,
    /// Arrival counter; every non-discarded update consumes one value.
    arrivals: u64,
    last_push_receipt: Option<u64>,
    last_poll_receipt: Option<u64>,
}

impl JobRecord {
    fn new(job_id: JobId) -> Self {
        Self {
            status: JobStatus::queued(job_id, Utc::now()),
            arrivals: 0,
            last_push_receipt: None,
            last_poll_receipt: None,
        }
    }

    fn last_receipt(&self, source: UpdateSource) -> Option<u64> {
        match source {
            UpdateSource::Push => self.last_push_receipt,
            UpdateSource::Poll => self.last_poll_receipt,
        }
    }

    fn record_receipt(&mut self, source: UpdateSource, receipt: u64) {
        let slot = match source {
            UpdateSource::Push => &mut self.last_push_receipt,
            UpdateSource::Poll => &mut self.last_poll_receipt,
        };
        *slot = Some(slot.map_or(receipt, |last| last.max(receipt)));
    }
}

impl JobSlot {
    fn new(job_id: JobId) -> Self {
        Self {
            gate: Mutex::new(()),
            holder: Mutex::new(None),
            record: RwLock::new(JobRecord::new(job_id)),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

/// Marks the current thread as the gate holder until dropped.
struct HolderMark<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> HolderMark<'a> {
    fn set(holder: &'a Mutex<Option<ThreadId>>) -> Self {
        *lock(holder) = Some(thread::current().id());
        Self(holder)
    }
}

impl Drop for HolderMark<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Begin tracking `job_id`, creating a `Queued` record if none exists.
    ///
    /// Returns the current status, which is the existing history when the
    /// job was tracked before.
    pub fn track(&self, job_id: &JobId) -> JobStatus {
        let slot = self.slot_or_create(job_id);
        let status = read(&slot.record).status.clone();
        status
    }

    /// Current reconciled status, if the job is known.
    pub fn get(&self, job_id: &JobId) -> Option<JobStatus> {
        let slot = self.slot(job_id)?;
        let status = read(&slot.record).status.clone();
        Some(status)
    }

    /// Whether the job is known and in a terminal phase.
    pub fn is_terminal(&self, job_id: &JobId) -> bool {
        self.get(job_id).is_some_and(|s| s.is_terminal())
    }

    /// Ids of every job with a record.
    pub fn job_ids(&self) -> Vec<JobId> {
        read(&self.slots).keys().cloned().collect()
    }

    /// Apply one update under the reconciliation rule.
    ///
    /// Subscribers are notified synchronously, after the mutation, before
    /// this returns, and exactly once per accepted update.
    pub fn ingest(&self, update: JobUpdate) -> IngestOutcome {
        self.ingest_if(update, || true)
    }

    /// Like [`ingest`](Self::ingest), but first evaluates `admit` while
    /// holding the job's gate. A `false` answer leaves the record
    /// untouched and returns [`IngestOutcome::Withdrawn`].
    pub fn ingest_if(&self, update: JobUpdate, admit: impl FnOnce() -> bool) -> IngestOutcome {
        if let Err(e) = update.validate() {
            tracing::warn!(
                job_id = %update.job_id,
                source = %update.source,
                error = %e,
                "Rejected malformed update",
            );
            return IngestOutcome::Rejected(e.to_string());
        }

        let slot = self.slot_or_create(&update.job_id);
        let _gate = lock(&slot.gate);
        let _holder = HolderMark::set(&slot.holder);

        if !admit() {
            tracing::debug!(
                job_id = %update.job_id,
                source = %update.source,
                "Withdrawn update",
            );
            return IngestOutcome::Withdrawn;
        }

        let outcome = {
            let mut record = write(&slot.record);
            if record.status.is_terminal() {
                IngestOutcome::Discarded
            } else {
                record.arrivals += 1;
                let sequence = record.arrivals;
                let last_receipt = record.last_receipt(update.source);

                match reconcile(&record.status, last_receipt, &update) {
                    Decision::Accept(applied) => {
                        record.record_receipt(update.source, update.receipt_seq);
                        let status = &mut record.status;
                        status.phase = applied.phase;
                        status.percent_complete = applied.percent_complete;
                        status.message = applied.message;
                        status.last_update_source = Some(update.source);
                        status.last_update_sequence = sequence;
                        status.updated_at = Utc::now();
                        IngestOutcome::Accepted(status.clone())
                    }
                    Decision::Duplicate => IngestOutcome::Duplicate,
                    Decision::Superseded(reason) => IngestOutcome::Superseded(reason),
                    Decision::Frozen => IngestOutcome::Discarded,
                }
            }
        };

        match &outcome {
            IngestOutcome::Accepted(status) => {
                tracing::debug!(
                    job_id = %status.job_id,
                    source = %update.source,
                    phase = %status.phase,
                    percent = status.percent_complete,
                    sequence = status.last_update_sequence,
                    "Accepted update",
                );
                let callbacks: Vec<StatusCallback> = lock(&slot.subscribers)
                    .iter()
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect();
                for callback in callbacks {
                    callback(status);
                }
            }
            IngestOutcome::Superseded(reason) => {
                tracing::debug!(
                    job_id = %update.job_id,
                    source = %update.source,
                    receipt = update.receipt_seq,
                    reason = %reason,
                    "Update superseded",
                );
            }
            IngestOutcome::Duplicate => {
                tracing::trace!(job_id = %update.job_id, source = %update.source, "Duplicate update");
            }
            IngestOutcome::Discarded => {
                tracing::debug!(
                    job_id = %update.job_id,
                    source = %update.source,
                    "Discarded update for terminal job",
                );
            }
            IngestOutcome::Rejected(_) | IngestOutcome::Withdrawn => {}
        }

        outcome
    }

    /// Wait until no update for `job_id` is being applied.
    ///
    /// Returns immediately when called from a subscriber callback of the
    /// same job, since that thread already holds the gate.
    pub fn quiesce(&self, job_id: &JobId) {
        let Some(slot) = self.slot(job_id) else {
            return;
        };
        if *lock(&slot.holder) == Some(thread::current().id()) {
            return;
        }
        drop(lock(&slot.gate));
    }

    /// Register a callback for accepted updates to `job_id`.
    ///
    /// Creates the record if the job is not yet known.
    pub fn on_change(&self, job_id: &JobId, callback: StatusCallback) -> SubscriptionId {
        let slot = self.slot_or_create(job_id);
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&slot.subscribers).push((id, callback));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn remove_subscriber(&self, job_id: &JobId, id: SubscriptionId) -> bool {
        let Some(slot) = self.slot(job_id) else {
            return false;
        };
        let mut subscribers = lock(&slot.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Number of callbacks registered for `job_id`.
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.slot(job_id)
            .map(|slot| lock(&slot.subscribers).len())
            .unwrap_or(0)
    }

    /// Drop the record and its callbacks. Only the UI releases records.
    pub fn release(&self, job_id: &JobId) -> Option<JobStatus> {
        let slot = write(&self.slots).remove(job_id)?;
        let status = read(&slot.record).status.clone();
        tracing::debug!(job_id = %job_id, phase = %status.phase, "Released job record");
        Some(status)
    }

    // ---- private helpers ----

    fn slot(&self, job_id: &JobId) -> Option<Arc<JobSlot>> {
        read(&self.slots).get(job_id).cloned()
    }

    fn slot_or_create(&self, job_id: &JobId) -> Arc<JobSlot> {
        if let Some(slot) = self.slot(job_id) {
            return slot;
        }
        let mut slots = write(&self.slots);
        Arc::clone(
            slots
                .entry(job_id.clone())
                .or_insert_with(|| Arc::new(JobSlot::new(job_id.clone()))),
        )
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateSink for JobStore {
    fn deliver(&self, update: JobUpdate) {
        self.ingest(update);
    }
}

// Poisoning only means a subscriber callback panicked mid-notification.
// Records are fully written before callbacks run, so the data is intact.

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Job store mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!("Job store lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!("Job store lock poisoned, recovering");
        poisoned.into_inner()
    })
}
