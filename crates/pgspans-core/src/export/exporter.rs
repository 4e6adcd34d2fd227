//! HTTP delivery of span batches to the ingestion endpoint.

use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use tracing::{debug, warn};

use crate::error::ExportError;

/// Default ingestion endpoint.
pub const DEFAULT_EXPORTER_URL: &str = "https://ingest.metisdata.io/";

pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

const API_KEY_HEADER: &str = "x-api-key";
const TRACE_ID_HEADER: &str = "x-amzn-trace-id";
const REQUEST_ID_HEADER: &str = "x-amzn-requestid";

/// Shared by every target; immutable after construction.
#[derive(Debug, Clone)]
pub struct Exporter {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl Exporter {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// POSTs `batch` (serialized span objects) as one JSON array.
    ///
    /// Failures are logged here and returned; the caller decides whether to go on.
    pub async fn send(&self, batch: &[String]) -> Result<(), ExportError> {
        let Some(api_key) = self.api_key.as_deref() else {
            warn!(spans = batch.len(), "API key not configured, batch not exported");
            return Err(ExportError::MissingApiKey);
        };

        let body = format!("[{}]", batch.join(","));
        let bytes = body.len();

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, bytes)
            .header(API_KEY_HEADER, api_key)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %self.url, error = %e, "span export request failed");
                return Err(ExportError::Transport(e));
            }
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let trace_id = header_text(response.headers(), TRACE_ID_HEADER);
            let request_id = header_text(response.headers(), REQUEST_ID_HEADER);
            let body = response.text().await.unwrap_or_default();
            let err = ExportError::Status {
                status: status.as_u16(),
                body,
                trace_id,
                request_id,
            };
            warn!(error = %err, "span export rejected");
            return Err(err);
        }

        debug!(spans = batch.len(), bytes, status = status.as_u16(), "batch exported");
        Ok(())
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
