//! Client-side job progress synchronization.
//!
//! Tracks long-running server jobs (video upload, then processing) by
//! merging two independent sources into one reconciled status per job:
//!
//! - [`client`]: per-job push channel over WebSocket, with fixed-delay
//!   reconnection ([`reconnect`]) and frame handling ([`processor`]).
//! - [`poll`]: interval polling of the backend status endpoint
//!   ([`api`]) for jobs the push channel cannot serve.
//! - [`store`]: the only place a [`JobStatus`](trapick_core::job::JobStatus)
//!   is mutated; applies the reconciliation rule and notifies subscribers.
//! - [`coordinator`]: per-job lifecycle state machine and the
//!   `track` / `unsubscribe` entry point used by the UI.

pub mod api;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod messages;
pub mod poll;
pub mod processor;
pub mod reconnect;
pub mod store;
