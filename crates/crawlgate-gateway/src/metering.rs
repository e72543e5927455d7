use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::metrics::USAGE_REPORTS;
use crate::verifier::{EntityId, VerificationResult};

/// One licensed access, as submitted to `POST {authority}/usage`.
///
/// The authority stamps the event time on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageEvent {
    pub publisher_id: Option<EntityId>,
    pub client_id: Option<EntityId>,
    pub url: String,
    pub agent_ua: String,
    pub purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<EntityId>,
}

impl UsageEvent {
    pub fn from_verification(verdict: &VerificationResult, url: String, agent_ua: String) -> Self {
        Self {
            publisher_id: verdict.publisher_id.clone(),
            client_id: verdict.client_id.clone(),
            url,
            agent_ua,
            purpose: verdict.purpose.clone(),
            token_id: verdict.token_id.clone(),
        }
    }
}

/// Best-effort usage recording.
///
/// Each report runs as a detached task: the request that triggered it never
/// waits on it, failures are logged and counted but never retried, and a
/// client disconnect does not cancel it. Delivery is at most once.
#[derive(Debug, Clone)]
pub struct MeteringReporter {
    client: reqwest::Client,
    authority_url: String,
    timeout: Duration,
}

impl MeteringReporter {
    pub fn new(client: reqwest::Client, authority_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            authority_url: authority_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Fire-and-forget. The returned handle exists for tests; request paths drop it.
    pub fn record(&self, event: UsageEvent) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = format!("{}/usage", self.authority_url);
        let timeout = self.timeout;

        tokio::spawn(async move {
            let result = client.post(&url).timeout(timeout).json(&event).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    USAGE_REPORTS.with_label_values(&["delivered"]).inc();
                    tracing::debug!(url = %event.url, status = %resp.status(), "usage recorded");
                }
                Ok(resp) => {
                    USAGE_REPORTS.with_label_values(&["failed"]).inc();
                    tracing::warn!(
                        url = %event.url,
                        status = %resp.status(),
                        "usage report rejected by authority"
                    );
                }
                Err(e) => {
                    USAGE_REPORTS.with_label_values(&["failed"]).inc();
                    tracing::warn!(url = %event.url, error = %e, "usage report delivery failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict() -> VerificationResult {
        serde_json::from_str(r#"{"valid":true,"publisher_id":1,"client_id":2,"purpose":"inference"}"#)
            .unwrap()
    }

    #[test]
    fn test_event_body_omits_missing_token_id() {
        let event = UsageEvent::from_verification(
            &verdict(),
            "https://blog.example.com/a".to_string(),
            "GPTBot/1.1".to_string(),
        );
        let body = serde_json::to_value(&event).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "publisher_id": 1,
                "client_id": 2,
                "url": "https://blog.example.com/a",
                "agent_ua": "GPTBot/1.1",
                "purpose": "inference",
            })
        );
    }

    #[test]
    fn test_event_body_carries_token_id() {
        let mut v = verdict();
        v.token_id = Some(EntityId::from("tok_7"));
        let event = UsageEvent::from_verification(&v, "u".to_string(), "ua".to_string());
        assert_eq!(serde_json::to_value(&event).unwrap()["token_id"], "tok_7");
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let reporter = MeteringReporter::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            Duration::from_millis(300),
        );
        let event = UsageEvent::from_verification(&verdict(), "u".to_string(), "ua".to_string());
        // Task completes without panicking even though nothing is listening
        reporter.record(event).await.unwrap();
    }
}
