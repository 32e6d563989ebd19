//! JSON-over-HTTP identity provider adapter.
//!
//! Speaks a small vendor-neutral contract; a deployment puts a thin shim in
//! front of its actual identity service if the paths differ.
//!
//! | Operation | Request |
//! |---|---|
//! | verify primary | `POST primary/verify` |
//! | enrolled methods | `GET principals/{id}/methods` |
//! | begin step-up | `POST step-up/challenges` |
//! | complete step-up | `POST step-up/challenges/{id}/complete` |
//!
//! Status mapping: `400/401/403` (and `404/410` on completion) are
//! rejections, `422` on begin is an unsupported method, and `408`, `429`,
//! `5xx`, network errors and timeouts are unavailability.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use time::OffsetDateTime;
use url::Url;

use super::{
    Challenge, IdentityProvider, PrimaryCredential, ProviderError, StepUpResponse, StepUpResult,
    VerifiedPrincipal,
};
use crate::config::ProviderConfig;
use crate::types::StepUpMethod;
use crate::{AuthError, AuthResult};

/// HTTP identity provider adapter.
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    base_url: Url,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MethodsResponse {
    methods: BTreeSet<StepUpMethod>,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge_id: String,
    method: StepUpMethod,
    /// Seconds until the provider expires the challenge.
    expires_in: u64,
}

/// Which call a response belongs to; drives the status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    VerifyPrimary,
    EnrolledMethods,
    BeginStepUp,
    CompleteStepUp,
}

impl HttpIdentityProvider {
    /// Creates an adapter for `config.base_url`.
    ///
    /// `request_timeout` bounds every request end to end.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the base URL is invalid, uses plain
    /// HTTP without `allow_http`, or the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig, request_timeout: Duration) -> AuthResult<Self> {
        let mut base_url = Url::parse(&config.base_url).map_err(|e| {
            AuthError::configuration(format!("invalid provider base_url: {e}"))
        })?;

        match base_url.scheme() {
            "https" => {}
            "http" if config.allow_http => {}
            other => {
                return Err(AuthError::configuration(format!(
                    "provider base_url scheme '{other}' is not allowed"
                )));
            }
        }

        // Url::join replaces the last segment unless the path ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AuthError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::protocol(format!("invalid endpoint '{path}': {e}")))
    }

    async fn decode<T: DeserializeOwned>(
        call: Call,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T, ProviderError> {
        let response = result.map_err(|e| {
            tracing::warn!(?call, error = %e, "Identity provider request failed");
            ProviderError::unavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(call, status));
        }

        response.json::<T>().await.map_err(|e| {
            tracing::warn!(?call, error = %e, "Failed to decode identity provider response");
            ProviderError::protocol(e.to_string())
        })
    }
}

fn classify_status(call: Call, status: StatusCode) -> ProviderError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::rejected(format!("provider refused the request ({status})"))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE if call == Call::CompleteStepUp => {
            ProviderError::rejected("unknown or expired challenge")
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::unavailable(format!("provider asked to retry ({status})"))
        }
        s if s.is_server_error() => ProviderError::unavailable(format!("provider error ({s})")),
        s => ProviderError::protocol(format!("unexpected status {s}")),
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn verify_primary(
        &self,
        credential: &PrimaryCredential,
    ) -> Result<VerifiedPrincipal, ProviderError> {
        let url = self.endpoint("primary/verify")?;
        let result = self
            .http_client
            .post(url)
            .json(&json!({
                "identifier": credential.identifier,
                "secret": credential.secret(),
            }))
            .send()
            .await;
        Self::decode(Call::VerifyPrimary, result).await
    }

    async fn enrolled_methods(
        &self,
        principal_id: &str,
    ) -> Result<BTreeSet<StepUpMethod>, ProviderError> {
        let mut url = self.endpoint("principals/")?;
        url.path_segments_mut()
            .map_err(|()| ProviderError::protocol("base_url cannot carry a path"))?
            .pop_if_empty()
            .extend([principal_id, "methods"]);

        let result = self.http_client.get(url).send().await;
        let body: MethodsResponse = Self::decode(Call::EnrolledMethods, result).await?;
        Ok(body.methods)
    }

    async fn begin_step_up(
        &self,
        principal_id: &str,
        method: StepUpMethod,
    ) -> Result<Challenge, ProviderError> {
        let url = self.endpoint("step-up/challenges")?;
        let result = self
            .http_client
            .post(url)
            .json(&json!({ "principal_id": principal_id, "method": method }))
            .send()
            .await;

        let body: ChallengeResponse = match result {
            Ok(response) if response.status() == StatusCode::UNPROCESSABLE_ENTITY => {
                return Err(ProviderError::UnsupportedMethod { method });
            }
            other => Self::decode(Call::BeginStepUp, other).await?,
        };

        if body.method != method {
            return Err(ProviderError::protocol(format!(
                "challenge issued for {} instead of {method}",
                body.method
            )));
        }

        let expires_at = time::Duration::try_from(Duration::from_secs(body.expires_in))
            .ok()
            .and_then(|ttl| OffsetDateTime::now_utc().checked_add(ttl))
            .ok_or_else(|| {
                ProviderError::protocol(format!("expires_in {} out of range", body.expires_in))
            })?;

        Ok(Challenge {
            challenge_id: body.challenge_id,
            method: body.method,
            expires_at,
        })
    }

    async fn complete_step_up(
        &self,
        challenge_id: &str,
        response: &StepUpResponse,
    ) -> Result<StepUpResult, ProviderError> {
        let mut url = self.endpoint("step-up/challenges/")?;
        url.path_segments_mut()
            .map_err(|()| ProviderError::protocol("base_url cannot carry a path"))?
            .pop_if_empty()
            .extend([challenge_id, "complete"]);

        let result = self
            .http_client
            .post(url)
            .json(&json!({ "response": response.as_str() }))
            .send()
            .await;
        Self::decode(Call::CompleteStepUp, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(base_url: &str) -> HttpIdentityProvider {
        let config = ProviderConfig {
            base_url: base_url.to_string(),
            allow_http: true,
            ..ProviderConfig::default()
        };
        HttpIdentityProvider::new(&config, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let p = provider("http://idp.local/api/v1");
        assert_eq!(
            p.endpoint("primary/verify").unwrap().as_str(),
            "http://idp.local/api/v1/primary/verify"
        );

        let p = provider("http://idp.local/api/v1/");
        assert_eq!(
            p.endpoint("step-up/challenges").unwrap().as_str(),
            "http://idp.local/api/v1/step-up/challenges"
        );
    }

    #[test]
    fn test_rejects_plain_http_without_opt_in() {
        let config = ProviderConfig {
            base_url: "http://idp.local".to_string(),
            ..ProviderConfig::default()
        };
        assert!(HttpIdentityProvider::new(&config, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(Call::VerifyPrimary, StatusCode::UNAUTHORIZED),
            ProviderError::Rejected { .. }
        ));
        assert!(matches!(
            classify_status(Call::CompleteStepUp, StatusCode::GONE),
            ProviderError::Rejected { .. }
        ));
        assert!(matches!(
            classify_status(Call::EnrolledMethods, StatusCode::NOT_FOUND),
            ProviderError::Protocol { .. }
        ));
        assert!(
            classify_status(Call::VerifyPrimary, StatusCode::SERVICE_UNAVAILABLE).is_retryable()
        );
        assert!(
            classify_status(Call::BeginStepUp, StatusCode::TOO_MANY_REQUESTS).is_retryable()
        );
    }
}
