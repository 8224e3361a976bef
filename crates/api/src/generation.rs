//! Client for the generation backend
//!
//! The backend is an opaque, possibly slow, possibly failing dependency.
//! Calls carry a bounded timeout so a stuck upstream cannot hang a request,
//! and transient failures get a couple of quick retries before surfacing as
//! a retryable 502.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::ApiError;

/// Retries for transient backend failures. Two quick attempts on top of the
/// original call; anything beyond that is the caller's problem.
const RETRY_BASE_MS: u64 = 200;
const RETRY_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub auth_user_id: String,
    pub mode: String,
    pub topic: String,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    pub set_id: String,
    pub questions: serde_json::Value,
}

/// Generation backend client
#[derive(Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GenerationClient {
    pub fn new(http: reqwest::Client, base_url: String, timeout_ms: u64) -> Self {
        Self {
            http,
            base_url,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Generate a question set. Timeouts and 5xx responses are retryable
    /// upstream failures; a 4xx from the backend means our request was bad
    /// and retrying will not help.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ApiError> {
        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MS)
            .map(jitter)
            .take(RETRY_ATTEMPTS);

        RetryIf::spawn(
            strategy,
            || self.generate_once(request),
            |e: &ApiError| matches!(e, ApiError::Upstream(_)),
        )
        .await
    }

    async fn generate_once(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ApiError> {
        let url = format!("{}/v1/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Generation backend call failed");
                ApiError::Upstream("generation backend unreachable".to_string())
            })?;

        let status = response.status();
        if status.is_client_error() {
            tracing::error!(status = %status, "Generation backend rejected request");
            return Err(ApiError::Validation(
                "generation request rejected by backend".to_string(),
            ));
        }
        if !status.is_success() {
            tracing::warn!(status = %status, "Generation backend error");
            return Err(ApiError::Upstream(format!(
                "generation backend returned {}",
                status
            )));
        }

        response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Generation backend returned malformed body");
            ApiError::Upstream("generation backend returned malformed body".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            auth_user_id: "user_1".to_string(),
            mode: "full".to_string(),
            topic: "systems design".to_string(),
            count: 5,
        }
    }

    #[tokio::test]
    async fn successful_generation_parses_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/generate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"set_id":"set_1","questions":["q1","q2"]}"#)
            .create_async()
            .await;

        let client = GenerationClient::new(reqwest::Client::new(), server.url(), 5000);
        let result = client.generate(&request()).await.unwrap();
        assert_eq!(result.set_id, "set_1");
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let failed = server
            .mock("POST", "/v1/generate")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/v1/generate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"set_id":"set_1","questions":[]}"#)
            .create_async()
            .await;

        let client = GenerationClient::new(reqwest::Client::new(), server.url(), 5000);
        let result = client.generate(&request()).await;
        assert!(result.is_ok());
        failed.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/generate")
            .with_status(422)
            .expect(1)
            .create_async()
            .await;

        let client = GenerationClient::new(reqwest::Client::new(), server.url(), 5000);
        let result = client.generate(&request()).await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
        mock.assert_async().await;
    }
}
