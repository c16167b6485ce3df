//! Upload sinks: where decrypted batches go.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::position::PositionSample;

/// Why a sink refused a batch. Every variant is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The request never completed.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a failure status.
    #[error("upload rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        message: String,
    },

    /// No answer within the chunk timeout.
    #[error("upload timed out after {seconds} s")]
    Timeout {
        /// The timeout that elapsed.
        seconds: u64,
    },
}

/// Destination for decrypted position batches.
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Deliver one ordered chunk of samples.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the batch was not accepted.
    async fn upload(&self, traveler_id: &str, records: &[PositionSample]) -> Result<(), SinkError>;
}

/// JSON body posted by [`HttpUploadSink`].
#[derive(Debug, Serialize)]
struct UploadBody<'a> {
    traveler_id: &'a str,
    records: &'a [PositionSample],
}

const MAX_ERROR_BODY: usize = 512;

/// Posts each chunk as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpUploadSink {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpUploadSink {
    /// Create a sink for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Network`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_token,
            timeout,
        })
    }

    /// Target endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl UploadSink for HttpUploadSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn upload(&self, traveler_id: &str, records: &[PositionSample]) -> Result<(), SinkError> {
        let body = serde_json::to_vec(&UploadBody {
            traveler_id,
            records,
        })
        .map_err(|e| SinkError::Network(format!("encoding failed: {e}")))?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
            } else {
                SinkError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status.as_u16(), count = records.len(), "upload_accepted");
            return Ok(());
        }

        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Err(SinkError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

/// Writes batches to the log instead of the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUploadSink;

#[async_trait]
impl UploadSink for LogUploadSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn upload(&self, traveler_id: &str, records: &[PositionSample]) -> Result<(), SinkError> {
        info!(traveler = %traveler_id, count = records.len(), "position_batch");
        for sample in records {
            debug!(
                lat = sample.latitude,
                lon = sample.longitude,
                accuracy = sample.accuracy_meters,
                at = %sample.captured_at,
                "position"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample() -> PositionSample {
        PositionSample {
            latitude: 40.0,
            longitude: -74.0,
            accuracy_meters: 8.0,
            captured_at: Utc::now(),
            resolved_address: Some("1 Main St".to_string()),
            traveler_id: "t-1".to_string(),
        }
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::Rejected {
            status: 503,
            message: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "upload rejected with status 503: busy");
        assert_eq!(
            SinkError::Timeout { seconds: 30 }.to_string(),
            "upload timed out after 30 s"
        );
    }

    #[test]
    fn test_upload_body_shape() {
        let records = vec![sample()];
        let json = serde_json::to_value(UploadBody {
            traveler_id: "t-1",
            records: &records,
        })
        .unwrap();

        assert_eq!(json["traveler_id"], "t-1");
        assert_eq!(json["records"][0]["latitude"], 40.0);
        assert_eq!(json["records"][0]["resolved_address"], "1 Main St");
    }

    #[test]
    fn test_http_sink_builds() {
        let sink = HttpUploadSink::new(
            "https://example.invalid/positions",
            Some("token".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(sink.name(), "http");
        assert_eq!(sink.endpoint(), "https://example.invalid/positions");
    }

    #[tokio::test]
    async fn test_http_sink_unreachable_is_network_error() {
        let sink = HttpUploadSink::new("http://127.0.0.1:9/positions", None, Duration::from_secs(2))
            .unwrap();
        let err = sink.upload("t-1", &[sample()]).await.unwrap_err();
        assert!(matches!(
            err,
            SinkError::Network(_) | SinkError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        let sink = LogUploadSink;
        assert!(sink.upload("t-1", &[sample(), sample()]).await.is_ok());
        assert!(sink.upload("t-1", &[]).await.is_ok());
    }
}
