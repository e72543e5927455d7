//! Token verification against the licensing authority.
//!
//! `GET {authority}/verify?token=…&url=…` answers with a JSON verdict. Every
//! failure mode on our side of the call (transport error, timeout, non-2xx,
//! unparseable body) collapses into an invalid verdict with the reason
//! `verification_failed`, so a degraded authority can never crash or hang the
//! request pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::VERIFICATIONS;

/// Reason used when the authority could not produce a verdict.
pub const VERIFICATION_FAILED: &str = "verification_failed";
/// Reason used when the authority denied the token without saying why.
pub const INVALID_TOKEN: &str = "invalid_token";

/// Identifier as issued by the authority, kept in its original JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Number(serde_json::Number),
    Text(String),
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        EntityId::Number(n.into())
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, alias = "tokenId", skip_serializing_if = "Option::is_none")]
    pub token_id: Option<EntityId>,
}

impl VerificationResult {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            publisher_id: None,
            client_id: None,
            purpose: None,
            token_id: None,
        }
    }

    /// Reason to show the client for an invalid verdict.
    pub fn denial_reason(&self) -> &str {
        self.reason.as_deref().unwrap_or(INVALID_TOKEN)
    }
}

/// Why the authority produced no verdict.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("authority request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("authority returned {0}")]
    Status(reqwest::StatusCode),
    #[error("authority response parse failed: {0}")]
    Parse(#[source] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct LicenseVerifier {
    client: reqwest::Client,
    authority_url: String,
    timeout: Duration,
}

impl LicenseVerifier {
    pub fn new(client: reqwest::Client, authority_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            authority_url: authority_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Verify `token` for `request_url` (absolute, query string already removed).
    pub async fn verify(&self, token: &str, request_url: &str) -> VerificationResult {
        let result = match self.call_verify(token, request_url).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(url = %request_url, error = %e, "license verification failed");
                VERIFICATIONS.with_label_values(&["error"]).inc();
                return VerificationResult::invalid(VERIFICATION_FAILED);
            }
        };

        if result.valid {
            VERIFICATIONS.with_label_values(&["valid"]).inc();
            tracing::debug!(
                url = %request_url,
                publisher_id = ?result.publisher_id,
                client_id = ?result.client_id,
                "token accepted"
            );
        } else {
            VERIFICATIONS.with_label_values(&["invalid"]).inc();
            tracing::info!(url = %request_url, reason = %result.denial_reason(), "token rejected");
        }
        result
    }

    async fn call_verify(
        &self,
        token: &str,
        request_url: &str,
    ) -> Result<VerificationResult, VerifyError> {
        let url = format!("{}/verify", self.authority_url);

        let response = self
            .client
            .get(&url)
            .query(&[("token", token), ("url", request_url)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(VerifyError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifyError::Status(status));
        }

        response
            .json::<VerificationResult>()
            .await
            .map_err(VerifyError::Parse)
    }
}
