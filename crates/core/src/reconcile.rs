//! The reconciliation rule.
//!
//! [`reconcile`] decides, for one incoming [`JobUpdate`], whether it is
//! applied to the current [`JobStatus`] and what the resulting phase,
//! percentage and message are. The decision depends only on the current
//! record, the last accepted receipt sequence from the same source, and
//! the update itself, so it is safe to evaluate under the store's
//! per-job lock and trivially testable.
//!
//! Rules, in order:
//!
//! 1. A terminal record accepts nothing ([`Decision::Frozen`]).
//! 2. A terminal target phase is always accepted.
//! 3. A receipt sequence not newer than the last accepted one from the
//!    same source is stale.
//! 4. The phase may not move backwards.
//! 5. Within the same phase the percentage may not decrease.
//! 6. An update that changes nothing is a duplicate.

use std::fmt;

use crate::job::{JobPhase, JobStatus, JobUpdate, MAX_PERCENT};

/// The values written to the record when an update is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub phase: JobPhase,
    pub percent_complete: u8,
    pub message: String,
}

/// Why an update lost against the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supersession {
    /// The same source already delivered a newer update.
    StaleReceipt { last_accepted: u64, received: u64 },
    /// The update would move the phase backwards.
    PhaseRegression { current: JobPhase, proposed: JobPhase },
    /// The update would lower the percentage within the same phase.
    ProgressRegression { phase: JobPhase, current: u8, proposed: u8 },
}

impl fmt::Display for Supersession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Supersession::StaleReceipt {
                last_accepted,
                received,
            } => write!(f, "stale receipt {received} (last accepted {last_accepted})"),
            Supersession::PhaseRegression { current, proposed } => {
                write!(f, "phase regression {current} -> {proposed}")
            }
            Supersession::ProgressRegression {
                phase,
                current,
                proposed,
            } => write!(f, "progress regression in {phase}: {current}% -> {proposed}%"),
        }
    }
}

/// Outcome of evaluating one update against the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept(Applied),
    /// Identical to the current record, typically a replay after reconnect.
    Duplicate,
    Superseded(Supersession),
    /// The record is terminal and immutable.
    Frozen,
}

/// Evaluate `update` against `current`.
///
/// `last_receipt` is the receipt sequence of the last update accepted
/// from `update.source` for this job, if any.
pub fn reconcile(current: &JobStatus, last_receipt: Option<u64>, update: &JobUpdate) -> Decision {
    if current.is_terminal() {
        return Decision::Frozen;
    }

    let target = update
        .phase
        .unwrap_or_else(|| higher_phase(current.phase, JobPhase::Uploading));

    let message = update
        .message
        .clone()
        .unwrap_or_else(|| current.message.clone());

    if target.is_terminal() {
        let percent_complete = match target {
            JobPhase::Completed => MAX_PERCENT,
            _ => update.percent.unwrap_or(current.percent_complete),
        };
        return Decision::Accept(Applied {
            phase: target,
            percent_complete,
            message,
        });
    }

    if let Some(last_accepted) = last_receipt {
        if update.receipt_seq <= last_accepted {
            return Decision::Superseded(Supersession::StaleReceipt {
                last_accepted,
                received: update.receipt_seq,
            });
        }
    }

    if !current.phase.can_advance_to(target) {
        return Decision::Superseded(Supersession::PhaseRegression {
            current: current.phase,
            proposed: target,
        });
    }

    let percent_complete = match update.percent {
        Some(proposed) if target == current.phase && proposed < current.percent_complete => {
            return Decision::Superseded(Supersession::ProgressRegression {
                phase: target,
                current: current.percent_complete,
                proposed,
            });
        }
        Some(proposed) => proposed,
        None => current.percent_complete,
    };

    if target == current.phase
        && percent_complete == current.percent_complete
        && message == current.message
    {
        return Decision::Duplicate;
    }

    Decision::Accept(Applied {
        phase: target,
        percent_complete,
        message,
    })
}

fn higher_phase(a: JobPhase, b: JobPhase) -> JobPhase {
    if b.rank() > a.rank() {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;
    use crate::job::UpdateSource;
    use crate::types::JobId;

    fn job() -> JobId {
        JobId::from("job-1")
    }

    fn status(phase: JobPhase, percent: u8) -> JobStatus {
        JobStatus {
            phase,
            percent_complete: percent,
            message: "current".into(),
            ..JobStatus::queued(job(), Utc::now())
        }
    }

    #[test]
    fn progress_on_queued_moves_to_uploading() {
        let current = JobStatus::queued(job(), Utc::now());
        let update = JobUpdate::progress(job(), 1, 15, "upload complete");
        assert_matches!(
            reconcile(&current, None, &update),
            Decision::Accept(Applied { phase: JobPhase::Uploading, percent_complete: 15, .. })
        );
    }

    #[test]
    fn progress_keeps_later_phase() {
        let current = status(JobPhase::Processing, 15);
        let update = JobUpdate::progress(job(), 2, 40, "detecting vehicles");
        assert_matches!(
            reconcile(&current, Some(1), &update),
            Decision::Accept(Applied { phase: JobPhase::Processing, percent_complete: 40, .. })
        );
    }

    #[test]
    fn poll_without_percent_retains_existing_value() {
        let current = status(JobPhase::Uploading, 15);
        let update = JobUpdate::polled(job(), 1, JobPhase::Processing);
        let decision = reconcile(&current, None, &update);
        assert_eq!(
            decision,
            Decision::Accept(Applied {
                phase: JobPhase::Processing,
                percent_complete: 15,
                message: "current".into(),
            })
        );
    }

    #[test]
    fn lower_percent_in_same_phase_is_superseded() {
        let current = status(JobPhase::Uploading, 60);
        let update = JobUpdate::progress(job(), 9, 40, "late");
        assert_matches!(
            reconcile(&current, Some(5), &update),
            Decision::Superseded(Supersession::ProgressRegression { current: 60, proposed: 40, .. })
        );
    }

    #[test]
    fn lower_percent_in_new_phase_is_accepted() {
        let current = status(JobPhase::Uploading, 90);
        let mut update = JobUpdate::polled(job(), 1, JobPhase::Processing);
        update.percent = Some(5);
        assert_matches!(
            reconcile(&current, None, &update),
            Decision::Accept(Applied { phase: JobPhase::Processing, percent_complete: 5, .. })
        );
    }

    #[test]
    fn stale_receipt_is_superseded() {
        let current = status(JobPhase::Uploading, 60);
        let update = JobUpdate::progress(job(), 3, 70, "reordered");
        assert_matches!(
            reconcile(&current, Some(5), &update),
            Decision::Superseded(Supersession::StaleReceipt { last_accepted: 5, received: 3 })
        );
    }

    #[test]
    fn phase_regression_is_superseded() {
        let current = status(JobPhase::Processing, 20);
        let update = JobUpdate::polled(job(), 4, JobPhase::Uploading);
        assert_matches!(
            reconcile(&current, Some(3), &update),
            Decision::Superseded(Supersession::PhaseRegression {
                current: JobPhase::Processing,
                proposed: JobPhase::Uploading,
            })
        );
    }

    #[test]
    fn identical_update_is_duplicate() {
        let current = status(JobPhase::Uploading, 15);
        let update = JobUpdate::progress(job(), 7, 15, "current");
        assert_eq!(reconcile(&current, Some(6), &update), Decision::Duplicate);
    }

    #[test]
    fn completion_always_accepted_at_full_percent() {
        let current = status(JobPhase::Uploading, 40);
        // Receipt older than the last accepted one: terminal still wins.
        let update = JobUpdate::completed(job(), 1, "done");
        assert_matches!(
            reconcile(&current, Some(9), &update),
            Decision::Accept(Applied { phase: JobPhase::Completed, percent_complete: 100, .. })
        );
    }

    #[test]
    fn failure_keeps_percent_and_message() {
        let current = status(JobPhase::Processing, 55);
        let update = JobUpdate::polled(job(), 2, JobPhase::Failed);
        assert_eq!(
            reconcile(&current, Some(1), &update),
            Decision::Accept(Applied {
                phase: JobPhase::Failed,
                percent_complete: 55,
                message: "current".into(),
            })
        );
    }

    #[test]
    fn terminal_record_is_frozen() {
        for phase in [JobPhase::Completed, JobPhase::Failed] {
            let current = status(phase, 100);
            for update in [
                JobUpdate::polled(job(), 99, JobPhase::Processing),
                JobUpdate::progress(job(), 99, 100, "more"),
                JobUpdate::completed(job(), 99, "again"),
            ] {
                assert_eq!(reconcile(&current, None, &update), Decision::Frozen);
            }
        }
    }

    #[test]
    fn sources_do_not_share_receipt_sequences() {
        let current = status(JobPhase::Uploading, 15);
        let update = JobUpdate {
            source: UpdateSource::Poll,
            ..JobUpdate::polled(job(), 1, JobPhase::Processing)
        };
        // The caller passes the poll source's own last receipt (none yet).
        assert_matches!(reconcile(&current, None, &update), Decision::Accept(_));
    }

    #[test]
    fn supersession_messages_are_readable() {
        let s = Supersession::ProgressRegression {
            phase: JobPhase::Uploading,
            current: 60,
            proposed: 40,
        };
        assert_eq!(s.to_string(), "progress regression in uploading: 60% -> 40%");
    }
}
