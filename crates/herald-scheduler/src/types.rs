use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a scheduled message.
///
/// ```text
/// pending ──claim──▶ sending ──▶ sent (terminal)
///    ▲                  │
///    │                  └──────▶ failed
///    └── update (pending|failed) / sweep (stuck sending)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for its `schedule_at` time.
    Pending,
    /// Claimed by a dispatcher; a send is in flight.
    Sending,
    /// Delivered; no further transitions.
    Sent,
    /// Last send attempt failed. Only an explicit update re-queues it.
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Pending,
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    /// Rows in this state may be rewritten by an update or deleted.
    /// `sent` is terminal and `sending` belongs to its claimant.
    pub fn is_editable(self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A persisted scheduled-message job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    /// Server-assigned primary key.
    pub id: i64,
    /// Delivery destination (phone number / JID).
    pub phone: String,
    /// Message body.
    pub message: String,
    /// Provider id of a message being quoted, if any.
    pub reply_message_id: Option<String>,
    pub is_forwarded: bool,
    /// Opaque value handed to the sender untouched.
    pub duration: Option<i64>,
    /// Earliest instant the message may be dispatched.
    pub schedule_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Number of claims so far (including ones interrupted by a crash).
    pub attempts: u32,
    /// Last failure detail.
    pub error: Option<String>,
    /// Provider-assigned id, set on success.
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Caller-editable fields, used for both create and update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reply_message_id: Option<String>,
    #[serde(default)]
    pub is_forwarded: bool,
    #[serde(default)]
    pub duration: Option<i64>,
    /// Missing means "now", i.e. immediately due.
    #[serde(default)]
    pub schedule_at: Option<DateTime<Utc>>,
}

/// Validated, store-ready form of a [`MessagePayload`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFields {
    pub phone: String,
    pub message: String,
    pub reply_message_id: Option<String>,
    pub is_forwarded: bool,
    pub duration: Option<i64>,
    pub schedule_at: DateTime<Utc>,
}

/// What the dispatcher hands to a sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub phone: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_message_id: Option<String>,
    pub is_forwarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl From<&ScheduledMessage> for OutboundMessage {
    fn from(job: &ScheduledMessage) -> Self {
        Self {
            phone: job.phone.clone(),
            message: job.message.clone(),
            reply_message_id: job.reply_message_id.clone(),
            is_forwarded: job.is_forwarded,
            duration: job.duration,
        }
    }
}

/// Result of a caller-initiated "run now".
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// This call won the claim; the message was sent or failed.
    Resolved(ScheduledMessage),
    /// Someone else already claimed or resolved the message; nothing was sent.
    AlreadyProcessed(ScheduledMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for status in MessageStatus::ALL {
            let parsed: MessageStatus = status.as_str().parse().expect("parse failed");
            assert_eq!(parsed, status);
        }
        assert!("running".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn only_pending_and_failed_are_editable() {
        let editable: Vec<_> = MessageStatus::ALL
            .into_iter()
            .filter(|s| s.is_editable())
            .collect();
        assert_eq!(editable, vec![MessageStatus::Pending, MessageStatus::Failed]);
    }

    #[test]
    fn payload_defaults_from_minimal_json() {
        let p: MessagePayload =
            serde_json::from_str(r#"{"phone":"+1555","message":"hi"}"#).unwrap();
        assert!(!p.is_forwarded);
        assert!(p.schedule_at.is_none());
        assert!(p.duration.is_none());
    }
}
