//! REST API client for the backend's video status endpoints.
//!
//! Wraps `GET /api/videos/?ids=…` (used by the poll source) using
//! [`reqwest`], and parses the upload endpoint's response into the
//! [`JobId`] to track.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use trapick_core::job_events::{UPLOAD_STATUS_ERROR, UPLOAD_STATUS_SUCCESS};
use trapick_core::types::JobId;

/// One job's status as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolledStatus {
    #[serde(deserialize_with = "string_or_number")]
    pub id: JobId,
    /// Raw backend status, e.g. `"processing"`.
    pub processing_status: String,
}

/// Fetches current statuses for a batch of jobs. The production
/// implementation is [`StatusApi`].
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch_statuses(&self, ids: &[JobId]) -> Result<Vec<PolledStatus>, StatusApiError>;
}

/// HTTP client for the backend status endpoint.
pub struct StatusApi {
    client: reqwest::Client,
    api_url: String,
}

/// Errors from the status API layer.
#[derive(Debug, thiserror::Error)]
pub enum StatusApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Status API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Either a bare list or a paginated `{"results": [...]}` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum StatusListResponse {
    List(Vec<PolledStatus>),
    Paginated { results: Vec<PolledStatus> },
}

impl StatusListResponse {
    fn into_statuses(self) -> Vec<PolledStatus> {
        match self {
            StatusListResponse::List(v) | StatusListResponse::Paginated { results: v } => v,
        }
    }
}

impl StatusApi {
    /// Create a client whose requests time out after `timeout`.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8000`.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, StatusApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetch statuses for `ids` in one request.
    ///
    /// Entries for ids that were not asked for are dropped.
    pub async fn list_statuses(&self, ids: &[JobId]) -> Result<Vec<PolledStatus>, StatusApiError> {
        let joined = ids.iter().map(JobId::as_str).collect::<Vec<_>>().join(",");

        let response = self
            .client
            .get(format!("{}/api/videos/", self.api_url))
            .query(&[("ids", joined.as_str())])
            .send()
            .await?;

        let statuses = Self::parse_response::<StatusListResponse>(response)
            .await?
            .into_statuses();
        Ok(statuses.into_iter().filter(|s| ids.contains(&s.id)).collect())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`StatusApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, StatusApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StatusApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StatusApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl StatusFetcher for StatusApi {
    async fn fetch_statuses(&self, ids: &[JobId]) -> Result<Vec<PolledStatus>, StatusApiError> {
        self.list_statuses(ids).await
    }
}

// ---------------------------------------------------------------------------
// Upload receipt
// ---------------------------------------------------------------------------

/// Response body of the upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadReceipt {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub upload_id: Option<JobId>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadReceiptError {
    #[error("Malformed upload response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Upload rejected: {0}")]
    Rejected(String),

    #[error("Upload response has no upload_id")]
    MissingUploadId,
}

impl UploadReceipt {
    pub fn parse(body: &str) -> Result<Self, UploadReceiptError> {
        Ok(serde_json::from_str(body)?)
    }

    /// The job to track for a successful upload.
    pub fn job_id(&self) -> Result<JobId, UploadReceiptError> {
        match self.status.as_str() {
            UPLOAD_STATUS_SUCCESS => {}
            UPLOAD_STATUS_ERROR => return Err(UploadReceiptError::Rejected(self.message.clone())),
            other => {
                return Err(UploadReceiptError::Rejected(format!(
                    "unexpected status {other:?}: {}",
                    self.message
                )))
            }
        }
        match &self.upload_id {
            Some(id) if !id.is_empty() => Ok(id.clone()),
            _ => Err(UploadReceiptError::MissingUploadId),
        }
    }
}

// ---- serde helpers ----

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

impl From<RawId> for JobId {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => JobId::new(s),
            RawId::Number(n) => JobId::new(n.to_string()),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<JobId, D::Error> {
    RawId::deserialize(deserializer).map(JobId::from)
}

fn optional_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<JobId>, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?.map(JobId::from))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn polled_status_accepts_string_and_numeric_ids() {
        let list: StatusListResponse = serde_json::from_str(
            r#"[{"id":"a1","processing_status":"processing","title":"x"},
                {"id":7,"processing_status":"completed"}]"#,
        )
        .unwrap();
        let statuses = list.into_statuses();
        assert_eq!(statuses[0].id, JobId::from("a1"));
        assert_eq!(statuses[1].id, JobId::from("7"));
        assert_eq!(statuses[1].processing_status, "completed");
    }

    #[test]
    fn paginated_envelope_is_unwrapped() {
        let list: StatusListResponse = serde_json::from_str(
            r#"{"count":1,"next":null,"results":[{"id":"a1","processing_status":"pending"}]}"#,
        )
        .unwrap();
        assert_eq!(list.into_statuses().len(), 1);
    }

    #[test]
    fn api_url_trailing_slash_is_trimmed() {
        let api = StatusApi::with_client(reqwest::Client::new(), "http://127.0.0.1:8000/");
        assert_eq!(api.api_url(), "http://127.0.0.1:8000");
    }

    #[test]
    fn successful_upload_yields_job_id() {
        let receipt = UploadReceipt::parse(
            r#"{"status":"success","message":"Video uploaded","upload_id":"3f2a"}"#,
        )
        .unwrap();
        assert_eq!(receipt.job_id().unwrap(), JobId::from("3f2a"));
    }

    #[test]
    fn error_upload_is_rejected_with_message() {
        let receipt =
            UploadReceipt::parse(r#"{"status":"error","message":"No file provided"}"#).unwrap();
        assert_matches!(receipt.job_id(), Err(UploadReceiptError::Rejected(m)) if m == "No file provided");
    }

    #[test]
    fn success_without_id_is_an_error() {
        let receipt = UploadReceipt::parse(r#"{"status":"success","message":"ok"}"#).unwrap();
        assert_matches!(receipt.job_id(), Err(UploadReceiptError::MissingUploadId));
    }

    #[test]
    fn non_json_upload_response_is_malformed() {
        assert_matches!(
            UploadReceipt::parse("<html>500</html>"),
            Err(UploadReceiptError::Malformed(_))
        );
    }
}
