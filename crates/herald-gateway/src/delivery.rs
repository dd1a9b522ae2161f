use async_trait::async_trait;
use herald_core::config::WebhookSenderConfig;
use herald_scheduler::{MessageSender, OutboundMessage, SendError};
use serde::Deserialize;
use tracing::{debug, warn};

/// Delivers messages by POSTing them as JSON to a provider endpoint.
///
/// A 2xx answer must carry the provider's id as `{"message_id": "..."}`.
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct WebhookReply {
    #[serde(alias = "id")]
    message_id: String,
}

impl WebhookSender {
    pub fn new(cfg: &WebhookSenderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: cfg.url.clone(),
            token: cfg.token.clone().filter(|t| !t.is_empty()),
        }
    }
}

#[async_trait]
impl MessageSender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<String, SendError> {
        debug!(url = %self.url, phone = %msg.phone, "posting message to webhook");

        let mut req = self.client.post(&self.url).json(msg);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| SendError::Failed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "webhook rejected message");
            return Err(SendError::Failed(format!(
                "provider returned {}: {}",
                status.as_u16(),
                text.trim()
            )));
        }

        let reply: WebhookReply = resp
            .json()
            .await
            .map_err(|e| SendError::Failed(format!("bad provider response: {e}")))?;
        if reply.message_id.trim().is_empty() {
            return Err(SendError::Failed("provider returned an empty message id".into()));
        }
        Ok(reply.message_id)
    }
}
