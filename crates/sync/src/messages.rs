//! Push-channel message types and parser.
//!
//! The progress server sends flat JSON objects tagged by `"type"`:
//!
//! ```json
//! {"type": "progress_update", "progress": 40, "message": "Detecting vehicles"}
//! {"type": "processing_complete", "video_id": "…", "message": "Processing completed!"}
//! ```
//!
//! A `progress_update` carrying the current progress is also replayed
//! right after every (re)connect.

use serde::Deserialize;
use trapick_core::job::MAX_PERCENT;
use trapick_core::job_events::{MSG_TYPE_PROCESSING_COMPLETE, MSG_TYPE_PROGRESS_UPDATE};

/// All known push-channel message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PushMessage {
    /// Percentage progress for the job.
    #[serde(rename = "progress_update")]
    ProgressUpdate(ProgressUpdateData),

    /// The job finished processing.
    #[serde(rename = "processing_complete")]
    ProcessingComplete(ProcessingCompleteData),
}

impl PushMessage {
    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::ProgressUpdate(_) => MSG_TYPE_PROGRESS_UPDATE,
            PushMessage::ProcessingComplete(_) => MSG_TYPE_PROCESSING_COMPLETE,
        }
    }
}

/// Payload for `progress_update` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressUpdateData {
    /// Raw progress as sent; may be an integer or a float.
    pub progress: f64,
    #[serde(default)]
    pub message: String,
}

/// Payload for `processing_complete` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingCompleteData {
    /// Id of the finished job, echoed by the server.
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Parse a push-channel text frame into a typed enum.
///
/// Returns `Err` for malformed JSON, missing required fields or unknown
/// `type` values. Callers should log and drop these.
pub fn parse_message(text: &str) -> Result<PushMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Convert a raw `progress` value to a whole percentage.
///
/// Finite values are clamped to `0..=100` and rounded. Returns `None`
/// for NaN or infinities.
pub fn percent_from_progress(progress: f64) -> Option<u8> {
    if !progress.is_finite() {
        return None;
    }
    let clamped = progress.clamp(0.0, f64::from(MAX_PERCENT));
    Some(clamped.round() as u8)
}
