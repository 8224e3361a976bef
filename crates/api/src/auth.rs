//! Bearer-token authentication against the external identity provider
//!
//! The provider owns token verification; this module only asks "who is
//! this?" over HTTP and maps every failure to 401. A provider outage is the
//! one exception: that is a 502, not a mass logout.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// The verified caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    user_id: String,
    email: Option<String>,
}

/// Client for the identity provider's token-verification endpoint
#[derive(Clone)]
pub struct IdentityVerifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl IdentityVerifier {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }

    /// Verify a bearer token. Invalid tokens are 401; only a provider
    /// failure surfaces as upstream.
    pub async fn verify_token(&self, token: &str) -> Result<AuthUser, ApiError> {
        let url = format!("{}/v1/verify", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Identity provider unreachable");
                ApiError::Upstream("identity provider unreachable".to_string())
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ApiError::InvalidToken);
        }
        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "Identity provider error");
            return Err(ApiError::Upstream("identity provider error".to_string()));
        }

        let verified: VerifyResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Identity provider returned malformed body");
            ApiError::Upstream("identity provider error".to_string())
        })?;

        Ok(AuthUser {
            user_id: verified.user_id,
            email: verified.email,
        })
    }
}

/// Extract and verify the bearer token on authenticated routes
#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;

        state.identity.verify_token(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_token_resolves_user() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/verify")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"user_id":"user_1","email":"a@example.com"}"#)
            .create_async()
            .await;

        let verifier = IdentityVerifier::new(
            reqwest::Client::new(),
            server.url(),
            "test-key".to_string(),
        );
        let user = verifier.verify_token("good-token").await.unwrap();
        assert_eq!(user.user_id, "user_1");
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_token_maps_to_401_not_500() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/verify")
            .with_status(401)
            .create_async()
            .await;

        let verifier = IdentityVerifier::new(
            reqwest::Client::new(),
            server.url(),
            "test-key".to_string(),
        );
        let result = verifier.verify_token("bad-token").await;
        assert!(matches!(result, Err(ApiError::InvalidToken)));
    }

    #[tokio::test]
    async fn provider_failure_is_upstream_not_auth() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/verify")
            .with_status(500)
            .create_async()
            .await;

        let verifier = IdentityVerifier::new(
            reqwest::Client::new(),
            server.url(),
            "test-key".to_string(),
        );
        let result = verifier.verify_token("token").await;
        assert!(matches!(result, Err(ApiError::Upstream(_))));
    }
}
