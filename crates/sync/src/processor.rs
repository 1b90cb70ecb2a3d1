//! Push frame processing loop.
//!
//! Reads frames from one open push connection, parses text frames into
//! typed [`PushMessage`] variants, turns them into [`JobUpdate`]s and
//! hands those to the client's sink. Receipt sequences are assigned here,
//! in arrival order.

use futures::StreamExt;
use trapick_core::job::JobUpdate;

use crate::client::{PushFrame, PushShared, PushStream};
use crate::messages::{
    parse_message, percent_from_progress, ProcessingCompleteData, ProgressUpdateData, PushMessage,
};

/// Process frames until the server closes the connection, a receive
/// error occurs, or the stream ends. All three count as a disconnect.
pub(crate) async fn process_messages(stream: &mut PushStream, shared: &PushShared) {
    let job_id = &shared.job_id;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(PushFrame::Text(text)) => {
                handle_text_message(&text, shared);
            }
            Ok(PushFrame::Ignored(kind)) => {
                tracing::trace!(job_id = %job_id, kind, "Ignoring push frame");
            }
            Ok(PushFrame::Close) => {
                tracing::info!(job_id = %job_id, "Push channel closed by server");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Push channel receive error");
                return;
            }
        }
    }
    tracing::debug!(job_id = %job_id, "Push stream ended");
}

/// Dispatch a single text frame.
fn handle_text_message(text: &str, shared: &PushShared) {
    let update = match parse_message(text) {
        Ok(msg) => {
            tracing::trace!(job_id = %shared.job_id, kind = msg.kind(), "Push message");
            match msg {
                PushMessage::ProgressUpdate(data) => progress_update(shared, &data),
                PushMessage::ProcessingComplete(data) => processing_complete(shared, &data),
            }
        }
        Err(e) => {
            tracing::warn!(
                job_id = %shared.job_id,
                error = %e,
                raw_message = %text,
                "Failed to parse push message",
            );
            None
        }
    };

    if let Some(update) = update {
        shared.touch();
        shared.sink.deliver(update);
    }
}

// ---- individual message handlers ----

fn progress_update(shared: &PushShared, data: &ProgressUpdateData) -> Option<JobUpdate> {
    let Some(percent) = percent_from_progress(data.progress) else {
        tracing::warn!(
            job_id = %shared.job_id,
            progress = data.progress,
            "Dropping progress update with non-finite progress",
        );
        return None;
    };
    tracing::debug!(
        job_id = %shared.job_id,
        percent,
        message = %data.message,
        "Push progress",
    );
    Some(JobUpdate::progress(
        shared.job_id.clone(),
        shared.next_receipt(),
        percent,
        data.message.clone(),
    ))
}

fn processing_complete(shared: &PushShared, data: &ProcessingCompleteData) -> Option<JobUpdate> {
    if let Some(video_id) = data.video_id.as_deref() {
        if video_id != shared.job_id.as_str() {
            tracing::warn!(
                job_id = %shared.job_id,
                video_id,
                "Dropping completion for a different job",
            );
            return None;
        }
    }
    tracing::info!(job_id = %shared.job_id, "Push channel reported completion");
    Some(JobUpdate::completed(
        shared.job_id.clone(),
        shared.next_receipt(),
        data.message.clone(),
    ))
}
