use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::SubmitError;
use crate::remote::payload::{parse_batch_ack, BatchAck, BatchPayload, SingleRecordPayload};
use crate::remote::SubmissionService;

// Error bodies are echoed into the queue's last_error column.
const MAX_ERROR_BODY: usize = 200;

pub struct HttpSubmissionService {
    client: Client,
    batch_url: String,
    single_url: String,
}

impl HttpSubmissionService {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            batch_url: config.batch_url(),
            single_url: config.single_url(),
        })
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<String, SubmitError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| SubmitError::Transient(describe_transport_error(&e)))?;

        let status = response.status();
        // A body we fail to read after a 2xx is still a 2xx; treat it as empty.
        let text = response.text().await.unwrap_or_default();
        debug!(url, status = status.as_u16(), "submission response");
        classify_response(status, text)
    }
}

#[async_trait]
impl SubmissionService for HttpSubmissionService {
    async fn submit_batch(&self, payload: &BatchPayload) -> Result<BatchAck, SubmitError> {
        let body = self.post_json(&self.batch_url, payload).await?;
        Ok(parse_batch_ack(&body))
    }

    async fn submit_single(&self, payload: &SingleRecordPayload) -> Result<(), SubmitError> {
        self.post_json(&self.single_url, payload).await.map(|_| ())
    }
}

/// Maps an HTTP status to the sync error taxonomy. Returns the body on 2xx.
pub fn classify_response(status: StatusCode, body: String) -> Result<String, SubmitError> {
    if status.is_success() {
        return Ok(body);
    }

    let message = summarize_body(&body);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Err(SubmitError::Transient(format!("HTTP {}: {}", status.as_u16(), message)));
    }
    if status.is_client_error() {
        warn!(status = status.as_u16(), %message, "submission rejected by server");
        return Err(SubmitError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    // 1xx/3xx that reqwest did not resolve: nothing was confirmed.
    Err(SubmitError::Transient(format!(
        "unexpected HTTP {}",
        status.as_u16()
    )))
}

fn describe_transport_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {}", error)
    } else {
        error.to_string()
    }
}

fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no response body".to_string();
    }
    if trimmed.chars().count() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut summary: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
    summary.push('…');
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_returns_body() {
        assert_eq!(
            classify_response(StatusCode::OK, "{}".to_string()),
            Ok("{}".to_string())
        );
        assert!(classify_response(StatusCode::CREATED, String::new()).is_ok());
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(matches!(
                classify_response(status, String::new()),
                Err(SubmitError::Transient(_))
            ));
        }
    }

    #[test]
    fn client_errors_are_rejections() {
        let result = classify_response(
            StatusCode::BAD_REQUEST,
            r#"{"error": "Project and date are required."}"#.to_string(),
        );
        match result {
            Err(SubmitError::Rejected { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("Project and date"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            classify_response(StatusCode::NOT_FOUND, String::new()),
            Err(SubmitError::Rejected { status: 404, .. })
        ));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let summary = summarize_body(&body);
        assert_eq!(summary.chars().count(), MAX_ERROR_BODY + 1);
    }
}
