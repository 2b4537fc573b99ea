//! Webhook fan-out.
//!
//! One implementation of [`EventPublisher`]: every active endpoint
//! subscribed to a topic receives the payload, signed per endpoint with
//! `X-Summa-Signature: HMAC-SHA256(secret, body)`. Failures back off on
//! the {5s, 30s, 2m, 15m, 1h} schedule; each attempt is recorded.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Result;
use crate::outbox::EventPublisher;
use crate::store::{dialect, Store};

type HmacSha256 = Hmac<Sha256>;

/// Seconds until the next retry, indexed by how many attempts failed so
/// far; the last step repeats.
const BACKOFF_SECS: [i64; 5] = [5, 30, 120, 900, 3600];

pub fn backoff_delay(failed_attempts: u32) -> Duration {
    let idx = (failed_attempts.max(1) as usize).min(BACKOFF_SECS.len()) - 1;
    Duration::seconds(BACKOFF_SECS[idx])
}

pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub topics: Value,
    pub active: bool,
}

impl WebhookEndpoint {
    fn subscribes_to(&self, topic: &str) -> bool {
        match self.topics.as_array() {
            Some(topics) if !topics.is_empty() => topics
                .iter()
                .any(|t| t.as_str().is_some_and(|t| t == topic || t == "*")),
            // An empty subscription list means everything.
            _ => true,
        }
    }
}

pub struct WebhookPublisher {
    store: Store,
    client: reqwest::Client,
}

impl WebhookPublisher {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
        }
    }

    async fn endpoints_for(&self, topic: &str) -> Result<Vec<WebhookEndpoint>> {
        let table = self.store.table("webhook_endpoint");
        let endpoints: Vec<WebhookEndpoint> = sqlx::query_as(&format!(
            "SELECT id, url, secret, topics, active FROM {table} WHERE active"
        ))
        .fetch_all(self.store.pool())
        .await?;
        Ok(endpoints
            .into_iter()
            .filter(|e| e.subscribes_to(topic))
            .collect())
    }

    async fn record_attempt(
        &self,
        endpoint_id: Uuid,
        event_id: Uuid,
        attempt: i32,
        status: &str,
        response_code: Option<i32>,
        error_message: Option<&str>,
        failed_attempts: u32,
    ) -> Result<()> {
        let table = self.store.table("webhook_delivery");
        let next_attempt_at = if status == "failed" {
            Some(Utc::now() + backoff_delay(failed_attempts))
        } else {
            None
        };
        sqlx::query(&format!(
            "INSERT INTO {table} \
             (endpoint_id, event_id, attempt, status, response_code, error_message, next_attempt_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(endpoint_id)
        .bind(event_id)
        .bind(attempt)
        .bind(status)
        .bind(response_code)
        .bind(error_message)
        .bind(next_attempt_at)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    async fn deliver(&self, endpoint: &WebhookEndpoint, event_id: Uuid, body: &[u8]) -> std::result::Result<(), String> {
        let table = self.store.table("webhook_delivery");
        let prior_failures: i64 = sqlx::query_scalar(&format!(
            "SELECT {} FROM {table} \
             WHERE endpoint_id = $1 AND event_id = $2 AND status = 'failed'",
            dialect::count_as_int("*")
        ))
        .bind(endpoint.id)
        .bind(event_id)
        .fetch_one(self.store.pool())
        .await
        .map_err(|e| e.to_string())?;
        let attempt = prior_failures as i32 + 1;

        let signature = sign_payload(&endpoint.secret, body);
        let response = self
            .client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header("X-Summa-Signature", signature)
            .body(body.to_vec())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                self.record_attempt(
                    endpoint.id,
                    event_id,
                    attempt,
                    "delivered",
                    Some(resp.status().as_u16() as i32),
                    None,
                    0,
                )
                .await
                .map_err(|e| e.to_string())?;
                Ok(())
            }
            Ok(resp) => {
                let code = resp.status().as_u16() as i32;
                let message = format!("endpoint returned {code}");
                self.record_attempt(
                    endpoint.id,
                    event_id,
                    attempt,
                    "failed",
                    Some(code),
                    Some(&message),
                    attempt as u32,
                )
                .await
                .map_err(|e| e.to_string())?;
                Err(message)
            }
            Err(err) => {
                let message = err.to_string();
                self.record_attempt(
                    endpoint.id,
                    event_id,
                    attempt,
                    "failed",
                    None,
                    Some(&message),
                    attempt as u32,
                )
                .await
                .map_err(|e| e.to_string())?;
                Err(message)
            }
        }
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, topic: &str, payload: &Value) -> std::result::Result<(), String> {
        let endpoints = self.endpoints_for(topic).await.map_err(|e| e.to_string())?;
        if endpoints.is_empty() {
            return Ok(());
        }
        let event_id = payload
            .get("transaction_id")
            .or_else(|| payload.get("account_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;

        let mut first_error = None;
        for endpoint in &endpoints {
            if let Err(err) = self.deliver(endpoint, event_id, &body).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            // One failing endpoint fails the outbox row so the retry loop
            // re-runs it; delivered endpoints dedup on their attempt log.
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_is_stable_and_secret_bound() {
        let body = br#"{"amount":100}"#;
        let sig = sign_payload("endpoint-secret", body);
        assert_eq!(sig, sign_payload("endpoint-secret", body));
        assert_ne!(sig, sign_payload("other-secret", body));
        assert_ne!(sig, sign_payload("endpoint-secret", br#"{"amount":101}"#));
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn backoff_schedule_matches_the_documented_steps() {
        assert_eq!(backoff_delay(1).num_seconds(), 5);
        assert_eq!(backoff_delay(2).num_seconds(), 30);
        assert_eq!(backoff_delay(3).num_seconds(), 120);
        assert_eq!(backoff_delay(4).num_seconds(), 900);
        assert_eq!(backoff_delay(5).num_seconds(), 3600);
        // Past the table the last step repeats.
        assert_eq!(backoff_delay(9).num_seconds(), 3600);
    }

    #[test]
    fn topic_subscription_supports_wildcards_and_empty_lists() {
        let mut endpoint = WebhookEndpoint {
            id: Uuid::new_v4(),
            url: "https://example.test/hook".to_string(),
            secret: "s".to_string(),
            topics: json!(["ledger-transaction-posted"]),
            active: true,
        };
        assert!(endpoint.subscribes_to("ledger-transaction-posted"));
        assert!(!endpoint.subscribes_to("ledger-account-created"));

        endpoint.topics = json!(["*"]);
        assert!(endpoint.subscribes_to("ledger-account-created"));

        endpoint.topics = json!([]);
        assert!(endpoint.subscribes_to("anything"));
    }
}
