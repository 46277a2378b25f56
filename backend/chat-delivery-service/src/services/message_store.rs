use crate::clock::Clock;
use crate::error::{AppError, AppResult, Resource};
use crate::models::{AppendOutcome, HistoryRange, Message, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use uuid::Uuid;

/// Append-only per-conversation message logs.
///
/// Implementations must assign `seq` atomically per conversation: concurrent
/// appends to one conversation get distinct consecutive numbers, appends to
/// different conversations never wait on each other.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: NewMessage, now: DateTime<Utc>) -> AppResult<AppendOutcome>;

    async fn read(&self, conversation_id: Uuid, range: HistoryRange) -> AppResult<Vec<Message>>;

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>>;

    /// Highest assigned seq, 0 for an empty conversation.
    async fn latest_seq(&self, conversation_id: Uuid) -> AppResult<i64>;

    /// Replace the body of a live message. `AlreadyDeleted` for tombstones.
    async fn update_body(
        &self,
        message_id: Uuid,
        body: String,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Message>;

    /// Turn a message into a tombstone. Deleting a tombstone returns it as is.
    async fn tombstone(&self, message_id: Uuid, deleted_at: DateTime<Utc>) -> AppResult<Message>;
}

/// Message rules (edit window, authorship) on top of a [`MessageStore`].
#[derive(Clone)]
pub struct MessageLog {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    edit_window: Duration,
    max_page: usize,
}

impl MessageLog {
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        edit_window: Duration,
        max_page: usize,
    ) -> Self {
        Self {
            store,
            clock,
            edit_window,
            max_page,
        }
    }

    pub async fn append(&self, message: NewMessage) -> AppResult<AppendOutcome> {
        message.validate()?;
        self.store.append(message, self.clock.now()).await
    }

    /// One page of history. The limit is clamped to the configured maximum.
    pub async fn read(&self, conversation_id: Uuid, range: HistoryRange) -> AppResult<Vec<Message>> {
        let range = match range {
            HistoryRange::After { after_seq, limit } => HistoryRange::After {
                after_seq: after_seq.max(0),
                limit: limit.clamp(1, self.max_page),
            },
            HistoryRange::Offset { skip, limit } => HistoryRange::Offset {
                skip,
                limit: limit.clamp(1, self.max_page),
            },
        };
        self.store.read(conversation_id, range).await
    }

    pub async fn get(&self, message_id: Uuid) -> AppResult<Message> {
        self.store
            .get(message_id)
            .await?
            .ok_or(AppError::NotFound(Resource::Message))
    }

    pub async fn latest_seq(&self, conversation_id: Uuid) -> AppResult<i64> {
        self.store.latest_seq(conversation_id).await
    }

    /// Lazy, finite walk over a conversation from `after_seq`, page by page.
    ///
    /// The end is fixed to the latest seq at call time so a busy conversation
    /// cannot keep the stream open forever. Restart from the last seen seq to
    /// resume.
    pub async fn stream_from(
        &self,
        conversation_id: Uuid,
        after_seq: i64,
    ) -> AppResult<BoxStream<'static, AppResult<Message>>> {
        let end = self.store.latest_seq(conversation_id).await?;
        let store = self.store.clone();
        let page = self.max_page;

        let pages = stream::try_unfold(after_seq.max(0), move |cursor| {
            next_page(store.clone(), conversation_id, cursor, end, page)
        });

        Ok(pages
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, AppError>)))
            .try_flatten()
            .boxed())
    }

    /// Only the sender may edit, only within the edit window, never a tombstone.
    pub async fn edit(&self, editor: Uuid, message_id: Uuid, body: String) -> AppResult<Message> {
        let message = self.get(message_id).await?;
        if message.sender_id != editor {
            return Err(AppError::PermissionDenied(
                "only the sender can edit a message".into(),
            ));
        }
        if message.is_deleted() {
            return Err(AppError::AlreadyDeleted);
        }
        let now = self.clock.now();
        if !message.within_edit_window(now, self.edit_window) {
            return Err(AppError::EditWindowExpired {
                max_edit_secs: self.edit_window.num_seconds(),
            });
        }

        let check = NewMessage {
            conversation_id: message.conversation_id,
            sender_id: editor,
            body: body.clone(),
            attachment_ref: message.attachment_ref.clone(),
            idempotency_key: None,
        };
        check.validate()?;

        self.store.update_body(message_id, body, now).await
    }

    /// Only the sender may delete. Repeated deletes succeed.
    pub async fn delete(&self, requester: Uuid, message_id: Uuid) -> AppResult<(Message, bool)> {
        let message = self.get(message_id).await?;
        if message.sender_id != requester {
            return Err(AppError::PermissionDenied(
                "only the sender can delete a message".into(),
            ));
        }
        if message.is_deleted() {
            return Ok((message, false));
        }
        let tombstone = self.store.tombstone(message_id, self.clock.now()).await?;
        Ok((tombstone, true))
    }
}

async fn next_page(
    store: Arc<dyn MessageStore>,
    conversation_id: Uuid,
    cursor: i64,
    end: i64,
    limit: usize,
) -> AppResult<Option<(Vec<Message>, i64)>> {
    if cursor >= end {
        return Ok(None);
    }
    let batch: Vec<Message> = store
        .read(
            conversation_id,
            HistoryRange::After {
                after_seq: cursor,
                limit,
            },
        )
        .await?
        .into_iter()
        .filter(|m| m.seq <= end)
        .collect();

    let next = batch.last().map(|last| last.seq);
    Ok(next.map(|next| (batch, next)))
}
