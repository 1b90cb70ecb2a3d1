//! Domain types and rules for client-side job progress tracking.
//!
//! Everything here is pure: no I/O, no locking, no logging. The
//! stateful pieces (store, push client, poll source, coordinator) live
//! in `trapick-sync` and build on these types.

pub mod error;
pub mod job;
pub mod job_events;
pub mod processing_status;
pub mod reconcile;
pub mod types;
