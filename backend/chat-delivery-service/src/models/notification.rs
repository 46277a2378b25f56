use crate::models::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characters of body copied into a notification preview
pub const PREVIEW_LEN: usize = 100;

/// Durable "you have an undelivered message" record.
///
/// At most one exists per (recipient, message). It is removed once the
/// recipient acknowledges reading up to its seq.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub seq: i64,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn for_message(recipient_id: Uuid, message: &Message, now: DateTime<Utc>) -> Self {
        Self {
            recipient_id,
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            seq: message.seq,
            preview: message_preview(message),
            created_at: now,
        }
    }
}

fn message_preview(message: &Message) -> String {
    if message.body.trim().is_empty() && message.attachment_ref.is_some() {
        return "[attachment]".to_string();
    }
    truncate_message_preview(&message.body, PREVIEW_LEN)
}

/// Cut to `max_len` characters, ending in "..." when shortened.
pub fn truncate_message_preview(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        message.to_string()
    } else {
        let truncated: String = message.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_message_preview() {
        assert_eq!(truncate_message_preview("Hello", 100), "Hello");
        assert_eq!(truncate_message_preview("Hello world!", 8), "Hello...");
        assert_eq!(truncate_message_preview("Hi", 10), "Hi");
    }

    #[test]
    fn test_truncate_counts_characters_not_bytes() {
        let s = "你好世界你好世界";
        assert_eq!(truncate_message_preview(s, 8), s);
        assert_eq!(truncate_message_preview(s, 5), "你好...");
    }

    #[test]
    fn attachment_only_message_gets_placeholder_preview() {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            seq: 3,
            body: String::new(),
            attachment_ref: Some("s3://bucket/a.png".into()),
            idempotency_key: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
        };
        let n = Notification::for_message(Uuid::new_v4(), &message, Utc::now());
        assert_eq!(n.preview, "[attachment]");
        assert_eq!(n.seq, 3);
    }
}
