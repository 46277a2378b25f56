use crate::error::AppResult;
use crate::models::{DeliveryState, Message, Notification};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Outcome of a read acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadOutcome {
    pub last_read_seq: i64,
    /// Notifications removed by this acknowledgment
    pub cleared: usize,
}

/// Durable delivery bookkeeping: receipts, notifications and read cursors.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Record that `message` is owed to `recipient`. No-op if a receipt exists.
    async fn record_pending(&self, recipient_id: Uuid, message: &Message) -> AppResult<()>;

    /// Move receipts of the given messages to Delivered. Read receipts stay
    /// Read. Returns how many receipts advanced.
    async fn mark_delivered(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        message_ids: &[Uuid],
    ) -> AppResult<usize>;

    async fn delivery_state(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        seq: i64,
    ) -> AppResult<Option<DeliveryState>>;

    /// Store a pending notification. Returns false when one already exists
    /// for the same (recipient, message).
    async fn create_notification(&self, notification: Notification) -> AppResult<bool>;

    /// All pending notifications for a recipient, oldest first.
    async fn pending_notifications(&self, recipient_id: Uuid) -> AppResult<Vec<Notification>>;

    async fn pending_for_conversation(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<Vec<Notification>>;

    /// Advance the read cursor (never backwards), mark receipts up to it as
    /// Read and drop the notifications they cover.
    async fn mark_read(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<ReadOutcome>;

    /// 0 when the recipient never acknowledged anything.
    async fn last_read_seq(&self, recipient_id: Uuid, conversation_id: Uuid) -> AppResult<i64>;

    /// Seqs in `(after_seq, up_to_seq]` already accounted for: a notification
    /// exists or the receipt reached Delivered.
    async fn settled_seqs(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        after_seq: i64,
        up_to_seq: i64,
    ) -> AppResult<HashSet<i64>>;
}
