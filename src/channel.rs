//! Outbound channel client.
//!
//! Sends rendered messages to the messaging platform's HTTP API, retrying
//! transport timeouts and a fixed allow-list of transient upstream codes
//! with exponential backoff. Every failure is classified so the
//! orchestrator can tag its report without inspecting the error text.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::engine::forms::MessageBody;

pub const NETWORK_TAG: &str = "NETWORK";
pub const CHANNEL_TAG: &str = "CHANNEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    Id { id: String },
    OneTimeNotifToken { one_time_notif_token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient: Recipient,
    pub message: MessageBody,
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("network failure talking to the channel: {message}")]
    Network { message: String, timeout: bool },
    #[error("channel rejected the send (code {code:?}): {message}")]
    Upstream { code: Option<i64>, message: String },
}

impl ChannelError {
    pub fn tag(&self) -> &'static str {
        match self {
            ChannelError::Network { .. } => NETWORK_TAG,
            ChannelError::Upstream { .. } => CHANNEL_TAG,
        }
    }

    /// Original upstream detail, carried into reports untouched.
    pub fn detail(&self) -> Value {
        match self {
            ChannelError::Network { message, .. } => json!({ "message": message }),
            ChannelError::Upstream { code, message } => {
                json!({ "code": code, "message": message })
            }
        }
    }
}

/// Retry schedule for outbound sends: `retries` extra attempts beyond the
/// first, sleeping `base * 2^attempt` between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base: Duration,
    pub transient_codes: Vec<i64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            base: Duration::from_millis(400),
            transient_codes: vec![1200, 551],
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base * 2u32.saturating_pow(attempt)
    }

    fn transient(&self, error: &ChannelError) -> bool {
        match error {
            ChannelError::Network { timeout, .. } => *timeout,
            ChannelError::Upstream { code, .. } => {
                code.is_some_and(|c| self.transient_codes.contains(&c))
            }
        }
    }
}

/// Run `call` under the retry schedule. Exhausting the budget surfaces the
/// final attempt's error unchanged; permanent failures surface immediately.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, ChannelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.retries || !policy.transient(&error) {
                    return Err(error);
                }
                let delay = policy.delay(attempt);
                tracing::debug!(
                    target: "channel",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "send_retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Port for everything the engine asks of the messaging platform.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    /// Deliver one message using the page credential. Returns the
    /// platform's acknowledgment payload.
    async fn send_message(
        &self,
        credential: &str,
        message: &OutboundMessage,
    ) -> Result<Value, ChannelError>;

    async fn user_profile(
        &self,
        credential: &str,
        user: &str,
    ) -> Result<Map<String, Value>, ChannelError>;
}

#[derive(Debug, Clone)]
pub struct HttpChannelClient {
    http: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl HttpChannelClient {
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            policy,
        }
    }

    fn classify_transport(error: reqwest::Error) -> ChannelError {
        ChannelError::Network {
            message: error.to_string(),
            timeout: error.is_timeout() || error.is_connect(),
        }
    }

    /// The platform reports failures as a 200 with an `error` object; pull
    /// it out and classify.
    fn classify_body(body: Value) -> Result<Value, ChannelError> {
        let Some(error) = body.get("error") else {
            return Ok(body);
        };
        Err(ChannelError::Upstream {
            code: error.get("code").and_then(Value::as_i64),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown channel error")
                .to_string(),
        })
    }

    async fn post_json(
        &self,
        credential: &str,
        url: &str,
        payload: &Value,
    ) -> Result<Value, ChannelError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(credential)
            .json(payload)
            .send()
            .await
            .map_err(Self::classify_transport)?;
        let body: Value = response.json().await.map_err(Self::classify_transport)?;
        Self::classify_body(body)
    }

    async fn get_json(&self, credential: &str, url: &str) -> Result<Value, ChannelError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(Self::classify_transport)?;
        let body: Value = response.json().await.map_err(Self::classify_transport)?;
        Self::classify_body(body)
    }
}

#[async_trait]
impl ChannelPort for HttpChannelClient {
    async fn send_message(
        &self,
        credential: &str,
        message: &OutboundMessage,
    ) -> Result<Value, ChannelError> {
        let url = format!("{}/me/messages", self.base_url);
        let payload = serde_json::to_value(message).map_err(|e| ChannelError::Network {
            message: e.to_string(),
            timeout: false,
        })?;
        with_retries(&self.policy, || self.post_json(credential, &url, &payload)).await
    }

    async fn user_profile(
        &self,
        credential: &str,
        user: &str,
    ) -> Result<Map<String, Value>, ChannelError> {
        let url = format!(
            "{}/{}?fields=id,name,first_name,last_name",
            self.base_url, user
        );
        let body = with_retries(&self.policy, || self.get_json(credential, &url)).await?;
        match body {
            Value::Object(map) => Ok(map),
            other => Err(ChannelError::Upstream {
                code: None,
                message: format!("unexpected profile payload: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn timeout_error() -> ChannelError {
        ChannelError::Network {
            message: "connect timed out".to_string(),
            timeout: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_makes_six_attempts_with_doubling_delays() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), ChannelError> = with_retries(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(timeout_error()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        // 400 + 800 + 1600 + 3200 + 6400
        assert_eq!(started.elapsed(), Duration::from_millis(12_400));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_tag_unchanged() {
        let policy = RetryPolicy::default();
        let result: Result<(), ChannelError> = with_retries(&policy, || async {
            Err(ChannelError::Upstream {
                code: Some(1200),
                message: "temporary send failure".to_string(),
            })
        })
        .await;
        let error = result.expect_err("retries should exhaust");
        assert_eq!(error.tag(), CHANNEL_TAG);
        assert_eq!(error.detail()["code"], json!(1200));
    }

    #[tokio::test]
    async fn permanent_upstream_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result: Result<(), ChannelError> = with_retries(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ChannelError::Upstream {
                    code: Some(10),
                    message: "permission denied".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_eventually_succeeds() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let value = with_retries(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(timeout_error())
                } else {
                    Ok(json!({"message_id": "m1"}))
                }
            }
        })
        .await
        .expect("third attempt should succeed");

        assert_eq!(value["message_id"], json!("m1"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn recipients_serialize_to_the_wire_shape() {
        let by_id = OutboundMessage {
            recipient: Recipient::Id {
                id: "101".to_string(),
            },
            message: MessageBody {
                text: "hi".to_string(),
                metadata: "{}".to_string(),
            },
        };
        let wire = serde_json::to_value(&by_id).expect("message should serialize");
        assert_eq!(wire["recipient"], json!({"id": "101"}));

        let by_token = Recipient::OneTimeNotifToken {
            one_time_notif_token: "TOK".to_string(),
        };
        let wire = serde_json::to_value(&by_token).expect("recipient should serialize");
        assert_eq!(wire, json!({"one_time_notif_token": "TOK"}));
    }
}
