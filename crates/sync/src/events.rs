//! Lifecycle events emitted by push clients.
//!
//! A [`PushClient`](crate::client::PushClient) reports connection-level
//! changes on an unbounded channel. The coordinator consumes them to
//! drive each job's sync state; transport errors never travel further.

use serde::Serialize;
use trapick_core::types::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PushEvent {
    /// The channel opened (initial connect or successful reconnect).
    Connected { job_id: JobId },

    /// The channel dropped without being closed deliberately.
    /// Reconnection is under way.
    Disconnected { job_id: JobId },

    /// Every reconnect attempt failed; the client is closed for good.
    Exhausted { job_id: JobId, attempts: u32 },
}

impl PushEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            PushEvent::Connected { job_id }
            | PushEvent::Disconnected { job_id }
            | PushEvent::Exhausted { job_id, .. } => job_id,
        }
    }
}
