//! Processing status values reported by the backend's status endpoint.
//!
//! These match the `processing_status` choices on the backend's video
//! records.

use crate::error::CoreError;
use crate::job::JobPhase;

pub const PROCESSING_STATUS_PENDING: &str = "pending";
pub const PROCESSING_STATUS_UPLOADED: &str = "uploaded";
pub const PROCESSING_STATUS_PROCESSING: &str = "processing";
pub const PROCESSING_STATUS_COMPLETED: &str = "completed";
pub const PROCESSING_STATUS_FAILED: &str = "failed";

/// Map a backend `processing_status` string to a [`JobPhase`].
pub fn phase_for_processing_status(status: &str) -> Result<JobPhase, CoreError> {
    match status {
        PROCESSING_STATUS_PENDING => Ok(JobPhase::Queued),
        PROCESSING_STATUS_UPLOADED => Ok(JobPhase::Uploading),
        PROCESSING_STATUS_PROCESSING => Ok(JobPhase::Processing),
        PROCESSING_STATUS_COMPLETED => Ok(JobPhase::Completed),
        PROCESSING_STATUS_FAILED => Ok(JobPhase::Failed),
        other => Err(CoreError::UnknownProcessingStatus(other.to_string())),
    }
}
