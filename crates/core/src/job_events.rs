//! Message type constants for the per-job progress stream.
//!
//! The backend tags every push-channel frame with one of these values in
//! its `"type"` field.

/// Progress update during upload or processing (percentage + message).
pub const MSG_TYPE_PROGRESS_UPDATE: &str = "progress_update";

/// Processing finished successfully.
pub const MSG_TYPE_PROCESSING_COMPLETE: &str = "processing_complete";

/// Upload endpoint `status` value for a rejected upload.
pub const UPLOAD_STATUS_ERROR: &str = "error";

/// Upload endpoint `status` value for an accepted upload.
pub const UPLOAD_STATUS_SUCCESS: &str = "success";
