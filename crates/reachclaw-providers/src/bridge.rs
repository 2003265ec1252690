//! HTTP bridge to the browser-automation service.
//!
//! The service owns the browser session and platform scraping; this side only
//! speaks JSON over HTTP. Every endpoint is a POST under `base_url`:
//!
//! | Path | Request | Response |
//! |---|---|---|
//! | `/discover` | `{organization}` | `{contacts: [RawContact]}` |
//! | `/connection-request` | `{contact_id, note}` | `{status, reason?}` |
//! | `/message` | `{contact_id, text}` | `{status, reason?}` |
//! | `/acceptance` | `{contact_id}` | `{detected}` |
//! | `/reply` | `{contact_id}` | `{detected}` |
//! | `/opt-out` | `{contact_id}` | `{detected}` |
//! | `/publish` | `{post_id, text}` | `{status, reason?}` |

use std::time::Duration;

use async_trait::async_trait;
use reachclaw_core::config::BridgeConfig;
use reachclaw_core::error::{OutreachError, Result};
use reachclaw_core::traits::{Delivery, Discovery, SendOutcome};
use reachclaw_core::types::{Contact, ContentPost, RawContact};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
struct DiscoverReply {
    #[serde(default)]
    contacts: Vec<RawContact>,
}

#[derive(Debug, Deserialize)]
struct ActionReply {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

impl ActionReply {
    fn into_outcome(self) -> SendOutcome {
        if self.status.eq_ignore_ascii_case("sent") {
            SendOutcome::Sent
        } else {
            SendOutcome::Failed(self.reason.unwrap_or(self.status))
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetectReply {
    detected: bool,
}

pub struct HttpBridge {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpBridge {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| OutreachError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| OutreachError::TransientCollaborator(format!("bridge {path}: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OutreachError::TransientCollaborator(format!(
                "bridge {path} returned {status}: {text}"
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| OutreachError::Serialization(format!("bridge {path}: {e}")))
    }

    async fn detect(&self, path: &str, contact: &Contact) -> Result<bool> {
        let reply: DetectReply = self.post(path, json!({ "contact_id": contact.id })).await?;
        Ok(reply.detected)
    }
}

#[async_trait]
impl Discovery for HttpBridge {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn discover(&self, organization: &str) -> Result<Vec<RawContact>> {
        let reply: DiscoverReply = self
            .post("/discover", json!({ "organization": organization }))
            .await?;
        Ok(reply.contacts)
    }
}

#[async_trait]
impl Delivery for HttpBridge {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn send_connection_request(&self, contact: &Contact, note: Option<&str>) -> Result<SendOutcome> {
        let reply: ActionReply = self
            .post(
                "/connection-request",
                json!({ "contact_id": contact.id, "note": note }),
            )
            .await?;
        Ok(reply.into_outcome())
    }

    async fn send_message(&self, contact: &Contact, text: &str) -> Result<SendOutcome> {
        let reply: ActionReply = self
            .post("/message", json!({ "contact_id": contact.id, "text": text }))
            .await?;
        Ok(reply.into_outcome())
    }

    async fn detect_acceptance(&self, contact: &Contact) -> Result<bool> {
        self.detect("/acceptance", contact).await
    }

    async fn detect_reply(&self, contact: &Contact) -> Result<bool> {
        self.detect("/reply", contact).await
    }

    async fn detect_opt_out(&self, contact: &Contact) -> Result<bool> {
        self.detect("/opt-out", contact).await
    }

    async fn publish_post(&self, post: &ContentPost) -> Result<SendOutcome> {
        let reply: ActionReply = self
            .post("/publish", json!({ "post_id": post.id, "text": post.text }))
            .await?;
        Ok(reply.into_outcome())
    }
}
