//! `trapick-watch` -- follow server-side jobs until they finish.
//!
//! Opens a push channel per job, falls back to polling when the channel
//! gives up, and exits once every job is completed or failed (or on
//! Ctrl-C, with a failure status if any job was still running).
//!
//! # Environment variables
//!
//! | Variable          | Required | Description                                   |
//! |-------------------|----------|-----------------------------------------------|
//! | `TRACK_JOB_IDS`   | yes      | Comma-separated job ids to follow             |
//! | `TRAPICK_WS_URL`  | no       | Push-channel base URL                         |
//! | `TRAPICK_API_URL` | no       | Backend HTTP base URL                         |
//!
//! Reconnect and poll timing variables are listed on
//! [`SyncConfig::from_env`](trapick_sync::config::SyncConfig::from_env).

use std::process::ExitCode;

use trapick_sync::config::SyncConfig;
use trapick_sync::coordinator::SyncCoordinator;
use trapick_watch::{exit_code, parse_job_ids, track_all, Completion};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trapick_watch=info,trapick_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ids = match parse_job_ids(std::env::var("TRACK_JOB_IDS").ok().as_deref()) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Invalid job list");
            return ExitCode::FAILURE;
        }
    };

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        jobs = ids.len(),
        ws_url = %config.ws_url,
        api_url = %config.api_url,
        "Starting trapick-watch",
    );

    let coordinator = match SyncCoordinator::from_config(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build status client");
            return ExitCode::FAILURE;
        }
    };

    let completion = Completion::new(&ids);
    let subscriptions = track_all(&coordinator, &ids, &completion);

    tokio::select! {
        _ = completion.wait() => {
            tracing::info!("All jobs finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(remaining = completion.remaining(), "Interrupted");
        }
    }

    let outstanding = completion.remaining();
    drop(subscriptions);
    coordinator.shutdown().await;
    ExitCode::from(exit_code(outstanding))
}
