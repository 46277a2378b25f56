//! Postgres storage backend on deadpool-postgres.
//!
//! Sequence numbers come from `conversation_counters`: the counter upsert and
//! the message insert run as one statement, so the counter row lock is the
//! only critical section and it is scoped to a single conversation.

use crate::error::{AppError, AppResult, Existing, Resource};
use crate::models::{
    AppendOutcome, Conversation, ConversationKind, DeliveryState, GroupInvite, HistoryRange,
    Message, NewMessage, Notification,
};
use crate::services::conversation_service::ConversationStore;
use crate::services::delivery_ledger::{DeliveryLedger, ReadOutcome};
use crate::services::message_store::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::HashSet;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use uuid::Uuid;

const MAX_APPEND_ATTEMPTS: usize = 3;

const SEQ_CONSTRAINT: &str = "messages_conversation_seq_key";
const IDEMPOTENCY_INDEX: &str = "idx_messages_idempotency";
const GROUP_NAME_INDEX: &str = "idx_conversations_group_name";

const CONVERSATION_COLUMNS: &str =
    "c.id, c.kind, c.name, c.creator_id, c.participant_a, c.participant_b, c.created_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, seq, body, attachment_ref, \
     idempotency_key, created_at, edited_at, deleted_at";

const NOTIFICATION_COLUMNS: &str =
    "recipient_id, message_id, conversation_id, sender_id, seq, preview, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn find_by_idempotency_key(
        &self,
        conversation_id: Uuid,
        key: &str,
    ) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND idempotency_key = $2"
                ),
                &[&conversation_id, &key],
            )
            .await?;
        Ok(row.as_ref().map(message_from_row))
    }
}

fn violates(err: &tokio_postgres::Error, constraint: &str) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
        && err
            .as_db_error()
            .and_then(|db| db.constraint())
            .map(|c| c == constraint)
            .unwrap_or(false)
}

fn conversation_from_row(row: &Row) -> AppResult<Conversation> {
    let kind: String = row.get("kind");
    let kind = match kind.as_str() {
        "private" => ConversationKind::Private {
            participants: [row.get("participant_a"), row.get("participant_b")],
        },
        "group" => ConversationKind::Group {
            name: row.get("name"),
            creator_id: row.get("creator_id"),
        },
        other => {
            return Err(AppError::Unavailable(format!(
                "unknown conversation kind {other:?}"
            )))
        }
    };
    Ok(Conversation {
        id: row.get("id"),
        kind,
        created_at: row.get("created_at"),
    })
}

fn message_from_row(row: &Row) -> Message {
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        seq: row.get("seq"),
        body: row.get("body"),
        attachment_ref: row.get("attachment_ref"),
        idempotency_key: row.get("idempotency_key"),
        created_at: row.get("created_at"),
        edited_at: row.get("edited_at"),
        deleted_at: row.get("deleted_at"),
    }
}

fn notification_from_row(row: &Row) -> Notification {
    Notification {
        recipient_id: row.get("recipient_id"),
        message_id: row.get("message_id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        seq: row.get("seq"),
        preview: row.get("preview"),
        created_at: row.get("created_at"),
    }
}

fn invite_from_row(row: &Row) -> GroupInvite {
    GroupInvite {
        group_id: row.get("group_id"),
        group_name: row.get("name"),
        inviter_id: row.get("inviter_id"),
        invitee_id: row.get("invitee_id"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn ensure_private(&self, conversation: Conversation) -> AppResult<Conversation> {
        let [a, b] = match &conversation.kind {
            ConversationKind::Private { participants } => *participants,
            ConversationKind::Group { .. } => {
                return Err(AppError::BadRequest("expected a private conversation".into()))
            }
        };

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute(
            "INSERT INTO conversations (id, kind, participant_a, participant_b, created_at) \
             VALUES ($1, 'private', $2, $3, $4) ON CONFLICT (id) DO NOTHING",
            &[&conversation.id, &a, &b, &conversation.created_at],
        )
        .await?;
        tx.execute(
            "INSERT INTO conversation_members (conversation_id, user_id) \
             VALUES ($1, $2), ($1, $3) ON CONFLICT DO NOTHING",
            &[&conversation.id, &a, &b],
        )
        .await?;
        let row = tx
            .query_one(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"),
                &[&conversation.id],
            )
            .await?;
        tx.commit().await?;
        conversation_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"),
                &[&id],
            )
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn create_group(&self, conversation: Conversation) -> AppResult<Conversation> {
        let (name, creator_id) = match &conversation.kind {
            ConversationKind::Group { name, creator_id } => (name.clone(), *creator_id),
            ConversationKind::Private { .. } => {
                return Err(AppError::BadRequest("expected a group conversation".into()))
            }
        };

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let inserted = tx
            .execute(
                "INSERT INTO conversations (id, kind, name, creator_id, created_at) \
                 VALUES ($1, 'group', $2, $3, $4)",
                &[&conversation.id, &name, &creator_id, &conversation.created_at],
            )
            .await;
        if let Err(e) = inserted {
            if violates(&e, GROUP_NAME_INDEX) {
                return Err(AppError::AlreadyExists(Existing::GroupName(name.clone())));
            }
            return Err(e.into());
        }
        tx.execute(
            "INSERT INTO conversation_members (conversation_id, user_id) VALUES ($1, $2)",
            &[&conversation.id, &creator_id],
        )
        .await?;
        tx.commit().await?;
        Ok(conversation)
    }

    async fn find_group(&self, name: &str) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
                     WHERE c.kind = 'group' AND c.name = $1"
                ),
                &[&name],
            )
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn add_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let exists = client
            .query_opt(
                "SELECT 1 FROM conversations WHERE id = $1 AND kind = 'group'",
                &[&group_id],
            )
            .await?
            .is_some();
        if !exists {
            return Err(AppError::NotFound(Resource::Group));
        }
        let inserted = client
            .execute(
                "INSERT INTO conversation_members (conversation_id, user_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&group_id, &user_id],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        // Row lock on the group serializes concurrent removals.
        tx.query_opt(
            "SELECT id FROM conversations WHERE id = $1 AND kind = 'group' FOR UPDATE",
            &[&group_id],
        )
        .await?
        .ok_or(AppError::NotFound(Resource::Group))?;

        let row = tx
            .query_one(
                "SELECT COUNT(*) AS members, \
                        COUNT(*) FILTER (WHERE user_id = $2) AS present \
                 FROM conversation_members WHERE conversation_id = $1",
                &[&group_id, &user_id],
            )
            .await?;
        let members: i64 = row.get("members");
        let present: i64 = row.get("present");
        if present == 0 {
            return Ok(false);
        }
        if members <= 1 {
            return Err(AppError::BadRequest(
                "cannot remove the last member of a group".into(),
            ));
        }

        tx.execute(
            "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
            &[&group_id, &user_id],
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM conversation_members \
                 WHERE conversation_id = $1 AND user_id = $2)",
                &[&conversation_id, &user_id],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn member_count(&self, conversation_id: Uuid) -> AppResult<usize> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as usize)
    }

    async fn members_page(
        &self,
        conversation_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> AppResult<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT user_id FROM conversation_members \
                 WHERE conversation_id = $1 AND ($2::uuid IS NULL OR user_id > $2) \
                 ORDER BY user_id LIMIT $3",
                &[&conversation_id, &after, &(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
                     JOIN conversation_members m ON m.conversation_id = c.id \
                     WHERE m.user_id = $1 ORDER BY c.created_at"
                ),
                &[&user_id],
            )
            .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    async fn create_invite(&self, invite: GroupInvite) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                "INSERT INTO group_invites (group_id, invitee_id, inviter_id, created_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                &[
                    &invite.group_id,
                    &invite.invitee_id,
                    &invite.inviter_id,
                    &invite.created_at,
                ],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn take_invite(
        &self,
        group_id: Uuid,
        invitee_id: Uuid,
    ) -> AppResult<Option<GroupInvite>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "DELETE FROM group_invites i USING conversations c \
                 WHERE i.group_id = $1 AND i.invitee_id = $2 AND c.id = i.group_id \
                 RETURNING i.group_id, i.invitee_id, i.inviter_id, i.created_at, c.name",
                &[&group_id, &invitee_id],
            )
            .await?;
        Ok(row.as_ref().map(invite_from_row))
    }

    async fn invites_for(&self, invitee_id: Uuid) -> AppResult<Vec<GroupInvite>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT i.group_id, i.invitee_id, i.inviter_id, i.created_at, c.name \
                 FROM group_invites i JOIN conversations c ON c.id = i.group_id \
                 WHERE i.invitee_id = $1 ORDER BY i.created_at",
                &[&invitee_id],
            )
            .await?;
        Ok(rows.iter().map(invite_from_row).collect())
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append(&self, message: NewMessage, now: DateTime<Utc>) -> AppResult<AppendOutcome> {
        if let Some(key) = &message.idempotency_key {
            if let Some(existing) = self
                .find_by_idempotency_key(message.conversation_id, key)
                .await?
            {
                return Ok(AppendOutcome::Duplicate(existing));
            }
        }

        let client = self.pool.get().await?;
        let sql = format!(
            "WITH next AS ( \
                 INSERT INTO conversation_counters (conversation_id, last_seq) \
                 VALUES ($2::uuid, 1) \
                 ON CONFLICT (conversation_id) \
                 DO UPDATE SET last_seq = conversation_counters.last_seq + 1 \
                 RETURNING last_seq \
             ) \
             INSERT INTO messages (id, conversation_id, sender_id, seq, body, \
                                   attachment_ref, idempotency_key, created_at) \
             SELECT $1::uuid, $2::uuid, $3::uuid, next.last_seq, $4::text, \
                    $5::text, $6::text, $7::timestamptz \
             FROM next \
             RETURNING {MESSAGE_COLUMNS}"
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = Uuid::new_v4();
            let inserted = client
                .query_one(
                    &sql,
                    &[
                        &id,
                        &message.conversation_id,
                        &message.sender_id,
                        &message.body,
                        &message.attachment_ref,
                        &message.idempotency_key,
                        &now,
                    ],
                )
                .await;

            match inserted {
                Ok(row) => return Ok(AppendOutcome::Appended(message_from_row(&row))),
                Err(e) if violates(&e, IDEMPOTENCY_INDEX) => {
                    let key = message.idempotency_key.as_deref().unwrap_or_default();
                    return self
                        .find_by_idempotency_key(message.conversation_id, key)
                        .await?
                        .map(AppendOutcome::Duplicate)
                        .ok_or_else(|| AppError::Conflict("idempotency key race".into()));
                }
                Err(e) if violates(&e, SEQ_CONSTRAINT) && attempt < MAX_APPEND_ATTEMPTS => {
                    tracing::warn!(
                        conversation_id = %message.conversation_id,
                        attempt,
                        "sequence collision on append, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read(&self, conversation_id: Uuid, range: HistoryRange) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let rows = match range {
            HistoryRange::After { after_seq, limit } => {
                client
                    .query(
                        &format!(
                            "SELECT {MESSAGE_COLUMNS} FROM messages \
                             WHERE conversation_id = $1 AND seq > $2 \
                             ORDER BY seq LIMIT $3"
                        ),
                        &[&conversation_id, &after_seq, &(limit as i64)],
                    )
                    .await?
            }
            HistoryRange::Offset { skip, limit } => {
                client
                    .query(
                        &format!(
                            "SELECT {MESSAGE_COLUMNS} FROM messages \
                             WHERE conversation_id = $1 \
                             ORDER BY seq OFFSET $2 LIMIT $3"
                        ),
                        &[&conversation_id, &(skip as i64), &(limit as i64)],
                    )
                    .await?
            }
        };
        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"),
                &[&message_id],
            )
            .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    async fn latest_seq(&self, conversation_id: Uuid) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT last_seq FROM conversation_counters WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await?;
        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    async fn update_body(
        &self,
        message_id: Uuid,
        body: String,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Message> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE messages SET body = $2, edited_at = $3 \
                     WHERE id = $1 AND deleted_at IS NULL \
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                &[&message_id, &body, &edited_at],
            )
            .await?;
        match row {
            Some(row) => Ok(message_from_row(&row)),
            None => match MessageStore::get(self, message_id).await? {
                Some(_) => Err(AppError::AlreadyDeleted),
                None => Err(AppError::NotFound(Resource::Message)),
            },
        }
    }

    async fn tombstone(&self, message_id: Uuid, deleted_at: DateTime<Utc>) -> AppResult<Message> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE messages SET body = '', attachment_ref = NULL, deleted_at = $2 \
                     WHERE id = $1 AND deleted_at IS NULL \
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                &[&message_id, &deleted_at],
            )
            .await?;
        match row {
            Some(row) => Ok(message_from_row(&row)),
            None => MessageStore::get(self, message_id)
                .await?
                .ok_or(AppError::NotFound(Resource::Message)),
        }
    }
}

#[async_trait]
impl DeliveryLedger for PgStore {
    async fn record_pending(&self, recipient_id: Uuid, message: &Message) -> AppResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO delivery_receipts (recipient_id, conversation_id, seq, message_id, state) \
                 VALUES ($1, $2, $3, $4, 'pending') ON CONFLICT DO NOTHING",
                &[
                    &recipient_id,
                    &message.conversation_id,
                    &message.seq,
                    &message.id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn mark_delivered(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        message_ids: &[Uuid],
    ) -> AppResult<usize> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE delivery_receipts SET state = 'delivered', updated_at = NOW() \
                 WHERE recipient_id = $1 AND conversation_id = $2 \
                   AND message_id = ANY($3) AND state = 'pending'",
                &[&recipient_id, &conversation_id, &message_ids],
            )
            .await?;
        Ok(updated as usize)
    }

    async fn delivery_state(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        seq: i64,
    ) -> AppResult<Option<DeliveryState>> {
        if seq >= 1 && seq <= self.last_read_seq(recipient_id, conversation_id).await? {
            return Ok(Some(DeliveryState::Read));
        }
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT state FROM delivery_receipts \
                 WHERE recipient_id = $1 AND conversation_id = $2 AND seq = $3",
                &[&recipient_id, &conversation_id, &seq],
            )
            .await?;
        Ok(row.and_then(|r| DeliveryState::from_db(r.get::<_, &str>(0))))
    }

    async fn create_notification(&self, notification: Notification) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                "INSERT INTO notifications \
                     (recipient_id, message_id, conversation_id, sender_id, seq, preview, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT DO NOTHING",
                &[
                    &notification.recipient_id,
                    &notification.message_id,
                    &notification.conversation_id,
                    &notification.sender_id,
                    &notification.seq,
                    &notification.preview,
                    &notification.created_at,
                ],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn pending_notifications(&self, recipient_id: Uuid) -> AppResult<Vec<Notification>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
                     WHERE recipient_id = $1 ORDER BY created_at, conversation_id, seq"
                ),
                &[&recipient_id],
            )
            .await?;
        Ok(rows.iter().map(notification_from_row).collect())
    }

    async fn pending_for_conversation(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<Vec<Notification>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
                     WHERE recipient_id = $1 AND conversation_id = $2 ORDER BY seq"
                ),
                &[&recipient_id, &conversation_id],
            )
            .await?;
        Ok(rows.iter().map(notification_from_row).collect())
    }

    async fn mark_read(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<ReadOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_one(
                "INSERT INTO read_cursors (recipient_id, conversation_id, last_read_seq) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (recipient_id, conversation_id) DO UPDATE \
                 SET last_read_seq = GREATEST(read_cursors.last_read_seq, EXCLUDED.last_read_seq), \
                     updated_at = NOW() \
                 RETURNING last_read_seq",
                &[&recipient_id, &conversation_id, &up_to_seq],
            )
            .await?;
        let last_read_seq: i64 = row.get(0);

        tx.execute(
            "UPDATE delivery_receipts SET state = 'read', updated_at = NOW() \
             WHERE recipient_id = $1 AND conversation_id = $2 AND seq <= $3 AND state <> 'read'",
            &[&recipient_id, &conversation_id, &last_read_seq],
        )
        .await?;
        let cleared = tx
            .execute(
                "DELETE FROM notifications \
                 WHERE recipient_id = $1 AND conversation_id = $2 AND seq <= $3",
                &[&recipient_id, &conversation_id, &last_read_seq],
            )
            .await?;
        tx.commit().await?;

        Ok(ReadOutcome {
            last_read_seq,
            cleared: cleared as usize,
        })
    }

    async fn last_read_seq(&self, recipient_id: Uuid, conversation_id: Uuid) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT last_read_seq FROM read_cursors \
                 WHERE recipient_id = $1 AND conversation_id = $2",
                &[&recipient_id, &conversation_id],
            )
            .await?;
        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    async fn settled_seqs(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        after_seq: i64,
        up_to_seq: i64,
    ) -> AppResult<HashSet<i64>> {
        if after_seq >= up_to_seq {
            return Ok(HashSet::new());
        }
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT seq FROM notifications \
                 WHERE recipient_id = $1 AND conversation_id = $2 AND seq > $3 AND seq <= $4 \
                 UNION \
                 SELECT seq FROM delivery_receipts \
                 WHERE recipient_id = $1 AND conversation_id = $2 AND seq > $3 AND seq <= $4 \
                   AND state IN ('delivered', 'read')",
                &[&recipient_id, &conversation_id, &after_seq, &up_to_seq],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }
}
