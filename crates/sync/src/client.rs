//! Push channel client.
//!
//! [`PushClient`] holds one job's server-push connection. It owns a
//! background task that connects through a [`PushConnector`], feeds every
//! parsed frame to an [`UpdateSink`], reconnects on non-deliberate drops
//! ([`reconnect_loop`]) and reports lifecycle changes as [`PushEvent`]s.
//!
//! Callers never see transport errors. They observe the
//! [`ConnectionState`] and the event channel instead.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use trapick_core::types::{JobId, Timestamp};

use crate::events::PushEvent;
use crate::processor::process_messages;
use crate::reconnect::{reconnect_loop, ReconnectConfig, ReconnectOutcome};
use crate::store::{ReceiptCounter, UpdateSink};

/// Connection state exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    /// Deliberately closed or reconnect budget exhausted. Final.
    Closed,
}

/// One frame received on a push channel, reduced to what the client
/// acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    Text(String),
    /// The server closed the channel.
    Close,
    /// Binary, ping, pong or raw frames. Carries the kind for logging.
    Ignored(&'static str),
}

/// Stream of frames for one open connection. Ends when the socket does.
pub type PushStream = BoxStream<'static, Result<PushFrame, PushClientError>>;

/// Opens push connections. The production implementation is
/// [`WsConnector`]; tests supply scripted streams.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, job_id: &JobId) -> Result<PushStream, PushClientError>;
}

/// WebSocket connector for the progress server.
///
/// The per-job URL is `{ws_url}/video-progress/{job_id}/`.
pub struct WsConnector {
    ws_url: String,
}

impl WsConnector {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://127.0.0.1:8000/ws`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn job_url(&self, job_id: &JobId) -> String {
        format!("{}/video-progress/{}/", self.ws_url.trim_end_matches('/'), job_id)
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, job_id: &JobId) -> Result<PushStream, PushClientError> {
        let url = self.job_url(job_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            PushClientError::Connection(format!("Failed to connect to {url}: {e}"))
        })?;

        tracing::info!(job_id = %job_id, "Connected to push channel at {url}");

        // Pings are answered by tungstenite while the stream is polled.
        let frames = ws_stream.map(|msg| match msg {
            Ok(Message::Text(text)) => Ok(PushFrame::Text(text.to_string())),
            Ok(Message::Binary(_)) => Ok(PushFrame::Ignored("binary")),
            Ok(Message::Ping(_)) => Ok(PushFrame::Ignored("ping")),
            Ok(Message::Pong(_)) => Ok(PushFrame::Ignored("pong")),
            Ok(Message::Frame(_)) => Ok(PushFrame::Ignored("frame")),
            Ok(Message::Close(_)) => Ok(PushFrame::Close),
            Err(e) => Err(PushClientError::Protocol(e.to_string())),
        });
        Ok(frames.boxed())
    }
}

/// Errors that can occur on a push channel.
#[derive(Debug, thiserror::Error)]
pub enum PushClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// State shared between a [`PushClient`] handle and its task.
pub(crate) struct PushShared {
    pub(crate) job_id: JobId,
    pub(crate) sink: Arc<dyn UpdateSink>,
    receipts: Arc<ReceiptCounter>,
    last_message_at: Mutex<Option<Timestamp>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl PushShared {
    pub(crate) fn next_receipt(&self) -> u64 {
        self.receipts.next()
    }

    pub(crate) fn touch(&self) {
        let mut last = self
            .last_message_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(Utc::now());
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            // Closed is final.
            if *current == state || *current == ConnectionState::Closed {
                return false;
            }
            *current = state;
            true
        });
    }
}

/// Handle to one job's push channel.
///
/// Dropping the handle does not close the channel; call [`close`](Self::close).
pub struct PushClient {
    shared: Arc<PushShared>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushClient {
    /// Open a push channel for `job_id` and start its connection task.
    ///
    /// Receipt sequences are drawn from `receipts`, which callers share
    /// across every client they open.
    ///
    /// Never fails: connection problems put the client into
    /// [`ConnectionState::Reconnecting`] and, once the budget is spent,
    /// [`ConnectionState::Closed`] with a [`PushEvent::Exhausted`].
    pub fn open(
        job_id: JobId,
        connector: Arc<dyn PushConnector>,
        sink: Arc<dyn UpdateSink>,
        receipts: Arc<ReceiptCounter>,
        config: ReconnectConfig,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(PushShared {
            job_id,
            sink,
            receipts,
            last_message_at: Mutex::new(None),
            state_tx,
        });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connection(
            Arc::clone(&shared),
            connector,
            config,
            events,
            cancel.clone(),
        ));

        Self {
            shared,
            state_rx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.shared.job_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// When the last text frame arrived, if any.
    pub fn last_message_at(&self) -> Option<Timestamp> {
        *self
            .shared
            .last_message_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliberate teardown. No reconnection follows. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(job_id = %self.shared.job_id, "Closing push channel");
        }
        self.cancel.cancel();
        self.shared.set_state(ConnectionState::Closed);
    }

    /// Take the connection task handle, for callers that want to await it.
    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Connection task: connect, process, reconnect, until closed.
async fn run_connection(
    shared: Arc<PushShared>,
    connector: Arc<dyn PushConnector>,
    config: ReconnectConfig,
    events: mpsc::UnboundedSender<PushEvent>,
    cancel: CancellationToken,
) {
    let job_id = shared.job_id.clone();

    let initial = tokio::select! {
        _ = cancel.cancelled() => None,
        result = connector.connect(&job_id) => Some(result),
    };

    let mut stream = match initial {
        None => {
            shared.set_state(ConnectionState::Closed);
            return;
        }
        Some(Ok(stream)) => stream,
        Some(Err(e)) => {
            tracing::warn!(job_id = %job_id, error = %e, "Push channel connect failed");
            shared.set_state(ConnectionState::Reconnecting);
            match reconnect(&shared, connector.as_ref(), &config, &events, &cancel).await {
                Some(stream) => stream,
                None => return,
            }
        }
    };

    loop {
        shared.set_state(ConnectionState::Open);
        let _ = events.send(PushEvent::Connected {
            job_id: job_id.clone(),
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                shared.set_state(ConnectionState::Closed);
                return;
            }
            _ = process_messages(&mut stream, &shared) => {}
        }

        if cancel.is_cancelled() {
            shared.set_state(ConnectionState::Closed);
            return;
        }

        tracing::info!(job_id = %job_id, "Push channel disconnected");
        shared.set_state(ConnectionState::Reconnecting);
        let _ = events.send(PushEvent::Disconnected {
            job_id: job_id.clone(),
        });

        stream = match reconnect(&shared, connector.as_ref(), &config, &events, &cancel).await {
            Some(stream) => stream,
            None => return,
        };
    }
}

/// Run one reconnect cycle. Returns `None` when the client is finished,
/// with the state already set to `Closed`.
async fn reconnect(
    shared: &PushShared,
    connector: &dyn PushConnector,
    config: &ReconnectConfig,
    events: &mpsc::UnboundedSender<PushEvent>,
    cancel: &CancellationToken,
) -> Option<PushStream> {
    match reconnect_loop(connector, &shared.job_id, config, cancel).await {
        ReconnectOutcome::Connected(stream) => Some(stream),
        ReconnectOutcome::Exhausted => {
            shared.set_state(ConnectionState::Closed);
            let _ = events.send(PushEvent::Exhausted {
                job_id: shared.job_id.clone(),
                attempts: config.max_attempts,
            });
            None
        }
        ReconnectOutcome::Cancelled => {
            shared.set_state(ConnectionState::Closed);
            None
        }
    }
}
