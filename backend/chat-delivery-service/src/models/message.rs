use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on a message body, in characters
pub const MAX_BODY_LEN: usize = 4000;

/// An entry in a conversation log.
///
/// `seq` is assigned by the store at append time: 1 for the first message of
/// a conversation, then strictly +1. It never changes afterwards, including
/// on edit and delete. Deleted messages stay in the log as tombstones with an
/// empty body so the sequence has no holes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub seq: i64,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Edits are allowed while `now < created_at + window`.
    pub fn within_edit_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now < self.created_at + window
    }

    /// Strip content, keep identity and position in the log.
    pub fn into_tombstone(mut self, deleted_at: DateTime<Utc>) -> Self {
        self.body.clear();
        self.attachment_ref = None;
        self.deleted_at = Some(deleted_at);
        self
    }
}

/// A message as submitted by a sender, before the store numbers it.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub attachment_ref: Option<String>,
    pub idempotency_key: Option<String>,
}

impl NewMessage {
    pub fn validate(&self) -> AppResult<()> {
        let has_attachment = self
            .attachment_ref
            .as_deref()
            .map(|a| !a.trim().is_empty())
            .unwrap_or(false);

        if self.body.trim().is_empty() && !has_attachment {
            return Err(AppError::BadRequest(
                "message needs a body or an attachment".into(),
            ));
        }
        if self.body.chars().count() > MAX_BODY_LEN {
            return Err(AppError::BadRequest(format!(
                "message body exceeds {MAX_BODY_LEN} characters"
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > 128 {
                return Err(AppError::BadRequest(
                    "idempotency_key must be 1-128 bytes".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn into_message(self, seq: i64, now: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            seq,
            body: self.body,
            attachment_ref: self.attachment_ref,
            idempotency_key: self.idempotency_key,
            created_at: now,
            edited_at: None,
            deleted_at: None,
        }
    }
}

/// Result of an append. A retried send with the same idempotency key gets
/// the original message back instead of a second log entry.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended(Message),
    Duplicate(Message),
}

impl AppendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            AppendOutcome::Appended(m) | AppendOutcome::Duplicate(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            AppendOutcome::Appended(m) | AppendOutcome::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// Which slice of a conversation log to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRange {
    /// Messages with `seq > after_seq`, oldest first
    After { after_seq: i64, limit: usize },
    /// Skip the first `skip` messages, oldest first
    Offset { skip: usize, limit: usize },
}

impl HistoryRange {
    pub fn limit(&self) -> usize {
        match self {
            HistoryRange::After { limit, .. } | HistoryRange::Offset { limit, .. } => *limit,
        }
    }

    /// Lowest seq (exclusive) this range can return
    pub fn floor_seq(&self) -> i64 {
        match self {
            HistoryRange::After { after_seq, .. } => (*after_seq).max(0),
            HistoryRange::Offset { skip, .. } => *skip as i64,
        }
    }
}

/// Per (message, recipient) delivery progress. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryState::Pending),
            "delivered" => Some(DeliveryState::Delivered),
            "read" => Some(DeliveryState::Read),
            _ => None,
        }
    }
}
