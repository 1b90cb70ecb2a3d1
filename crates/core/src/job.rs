//! Job phase, reconciled status and the raw update envelope.
//!
//! [`JobUpdate`] is what both sources (push channel and poll fallback)
//! hand to the store. [`JobStatus`] is what the store hands back to the
//! UI after reconciliation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Highest valid value of `percent_complete`.
pub const MAX_PERCENT: u8 = 100;

/// Lifecycle phase of a tracked job.
///
/// Ordered `Queued < Uploading < Processing < {Completed, Failed}`.
/// `Completed` and `Failed` are terminal and share the top rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl JobPhase {
    /// Position in the phase ordering. Terminal phases share a rank.
    pub fn rank(self) -> u8 {
        match self {
            JobPhase::Queued => 0,
            JobPhase::Uploading => 1,
            JobPhase::Processing => 2,
            JobPhase::Completed | JobPhase::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }

    /// Whether moving from `self` to `next` keeps the phase non-decreasing.
    ///
    /// Nothing leaves a terminal phase. `Failed` is reachable from every
    /// non-terminal phase.
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Queued => "queued",
            JobPhase::Uploading => "uploading",
            JobPhase::Processing => "processing",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which source delivered an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Push,
    Poll,
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateSource::Push => f.write_str("push"),
            UpdateSource::Poll => f.write_str("poll"),
        }
    }
}

/// Reconciled view of a job, owned and mutated only by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub phase: JobPhase,
    /// 0-100, non-decreasing within a phase.
    pub percent_complete: u8,
    /// Human-readable, informational only.
    pub message: String,
    /// `None` until the first update is accepted.
    pub last_update_source: Option<UpdateSource>,
    /// Store-assigned arrival sequence of the last accepted update.
    pub last_update_sequence: u64,
    pub updated_at: Timestamp,
}

impl JobStatus {
    /// Initial record created when tracking begins.
    pub fn queued(job_id: JobId, now: Timestamp) -> Self {
        Self {
            job_id,
            phase: JobPhase::Queued,
            percent_complete: 0,
            message: String::new(),
            last_update_source: None,
            last_update_sequence: 0,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// A raw update from either source, before reconciliation.
///
/// `phase == None` means "no phase information": the update applies at
/// the record's current phase, raised to at least [`JobPhase::Uploading`]
/// (progress frames are only sent once a transfer exists).
/// `percent == None` means the source does not know the percentage, and
/// the record's existing value is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub source: UpdateSource,
    /// Sequence assigned by the source on receipt, strictly increasing
    /// per job and per source.
    pub receipt_seq: u64,
    pub phase: Option<JobPhase>,
    pub percent: Option<u8>,
    pub message: Option<String>,
}

impl JobUpdate {
    /// A push-channel `progress_update`.
    pub fn progress(job_id: JobId, receipt_seq: u64, percent: u8, message: impl Into<String>) -> Self {
        Self {
            job_id,
            source: UpdateSource::Push,
            receipt_seq,
            phase: None,
            percent: Some(percent),
            message: Some(message.into()),
        }
    }

    /// A push-channel `processing_complete`.
    pub fn completed(job_id: JobId, receipt_seq: u64, message: impl Into<String>) -> Self {
        Self {
            job_id,
            source: UpdateSource::Push,
            receipt_seq,
            phase: Some(JobPhase::Completed),
            percent: Some(MAX_PERCENT),
            message: Some(message.into()),
        }
    }

    /// A poll result: phase only, no percentage, no message.
    pub fn polled(job_id: JobId, receipt_seq: u64, phase: JobPhase) -> Self {
        Self {
            job_id,
            source: UpdateSource::Poll,
            receipt_seq,
            phase: Some(phase),
            percent: None,
            message: None,
        }
    }

    /// Reject updates that could never have come from a well-behaved
    /// source. Runs before reconciliation.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.job_id.is_empty() {
            return Err(CoreError::Validation("job_id must not be empty".into()));
        }
        if let Some(p) = self.percent {
            if p > MAX_PERCENT {
                return Err(CoreError::Validation(format!(
                    "percent {p} out of range (max {MAX_PERCENT})"
                )));
            }
        }
        if self.phase.is_none() && self.percent.is_none() && self.message.is_none() {
            return Err(CoreError::Validation(
                "update carries no phase, percent or message".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobPhase; 5] = [
        JobPhase::Queued,
        JobPhase::Uploading,
        JobPhase::Processing,
        JobPhase::Completed,
        JobPhase::Failed,
    ];

    #[test]
    fn phases_advance_in_order() {
        assert!(JobPhase::Queued.can_advance_to(JobPhase::Uploading));
        assert!(JobPhase::Uploading.can_advance_to(JobPhase::Processing));
        assert!(JobPhase::Processing.can_advance_to(JobPhase::Completed));
        assert!(JobPhase::Queued.can_advance_to(JobPhase::Completed));
        assert!(!JobPhase::Processing.can_advance_to(JobPhase::Uploading));
        assert!(!JobPhase::Uploading.can_advance_to(JobPhase::Queued));
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_phase() {
        for phase in ALL.into_iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_advance_to(JobPhase::Failed), "{phase} -> failed");
        }
    }

    #[test]
    fn terminal_phases_are_absorbing() {
        for from in [JobPhase::Completed, JobPhase::Failed] {
            for to in ALL {
                assert!(!from.can_advance_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn queued_status_starts_at_zero() {
        let status = JobStatus::queued(JobId::from("job-1"), chrono::Utc::now());
        assert_eq!(status.phase, JobPhase::Queued);
        assert_eq!(status.percent_complete, 0);
        assert_eq!(status.last_update_sequence, 0);
        assert!(status.last_update_source.is_none());
        assert!(!status.is_terminal());
    }

    #[test]
    fn validate_rejects_empty_job_id() {
        let update = JobUpdate::progress(JobId::from(""), 1, 10, "x");
        let err = update.validate().unwrap_err();
        assert!(err.to_string().contains("job_id"));
    }

    #[test]
    fn validate_rejects_out_of_range_percent() {
        let mut update = JobUpdate::progress(JobId::from("a"), 1, 10, "x");
        update.percent = Some(101);
        assert!(update.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_payload() {
        let update = JobUpdate {
            job_id: JobId::from("a"),
            source: UpdateSource::Push,
            receipt_seq: 1,
            phase: None,
            percent: None,
            message: None,
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn completed_update_is_full_percent() {
        let update = JobUpdate::completed(JobId::from("a"), 3, "done");
        assert_eq!(update.phase, Some(JobPhase::Completed));
        assert_eq!(update.percent, Some(MAX_PERCENT));
        assert!(update.validate().is_ok());
    }

    #[test]
    fn phase_serializes_snake_case() {
        let json = serde_json::to_string(&JobPhase::Processing).unwrap();
        assert_eq!(json, r#""processing""#);
    }
}
