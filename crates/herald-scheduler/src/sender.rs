use async_trait::async_trait;

use crate::{error::SendError, types::OutboundMessage};

/// The external delivery capability (WhatsApp gateway, SMS provider, …).
///
/// Implementations must be `Send + Sync` so one sender can be shared by every
/// dispatcher worker and by the management API's "run now" path.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Stable lowercase identifier used in logs (e.g. `"webhook"`).
    fn name(&self) -> &str;

    /// Deliver one message and return the provider-assigned message id.
    ///
    /// Any error is terminal for this attempt; the caller records it and
    /// does not retry.
    async fn send(&self, msg: &OutboundMessage) -> Result<String, SendError>;
}

/// Placeholder used when no provider is configured. Every send fails, so
/// jobs end up `failed` (and can be re-queued with an update) instead of
/// being reported as delivered.
pub struct UnavailableSender;

#[async_trait]
impl MessageSender for UnavailableSender {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn send(&self, _msg: &OutboundMessage) -> Result<String, SendError> {
        Err(SendError::Unavailable(
            "no sender configured; set sender.webhook.url in herald.toml".into(),
        ))
    }
}
