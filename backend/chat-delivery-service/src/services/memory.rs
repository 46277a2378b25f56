//! In-process storage backend.
//!
//! Used when no `DATABASE_URL` is configured and by the test-suite. Every
//! conversation log sits behind its own async mutex, so appends to different
//! conversations never contend.

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
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{hash_map, BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct ConversationEntry {
    conversation: Conversation,
    members: BTreeSet<Uuid>,
}

/// Messages of one conversation; `messages[i].seq == i + 1`.
#[derive(Default)]
struct ConversationLog {
    messages: Vec<Message>,
    by_idempotency_key: HashMap<String, usize>,
}

#[derive(Debug, Clone, Copy)]
struct Receipt {
    message_id: Uuid,
    state: DeliveryState,
}

#[derive(Default)]
pub struct InMemoryStore {
    conversations: DashMap<Uuid, ConversationEntry>,
    group_names: DashMap<String, Uuid>,
    // user -> conversations they take part in
    memberships: DashMap<Uuid, BTreeSet<Uuid>>,
    invites: DashMap<(Uuid, Uuid), GroupInvite>,

    logs: DashMap<Uuid, Arc<Mutex<ConversationLog>>>,
    // message id -> (conversation, seq)
    message_index: DashMap<Uuid, (Uuid, i64)>,

    // (recipient, conversation) -> seq -> receipt
    receipts: DashMap<(Uuid, Uuid), BTreeMap<i64, Receipt>>,
    // recipient -> message id -> notification
    notifications: DashMap<Uuid, HashMap<Uuid, Notification>>,
    read_cursors: DashMap<(Uuid, Uuid), i64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, conversation_id: Uuid) -> Arc<Mutex<ConversationLog>> {
        self.logs.entry(conversation_id).or_default().clone()
    }

    fn existing_log(&self, conversation_id: Uuid) -> Option<Arc<Mutex<ConversationLog>>> {
        self.logs.get(&conversation_id).map(|log| log.clone())
    }

    fn locate(&self, message_id: Uuid) -> Option<(Uuid, i64)> {
        self.message_index.get(&message_id).map(|entry| *entry)
    }

    fn index_membership(&self, user_id: Uuid, conversation_id: Uuid) {
        self.memberships
            .entry(user_id)
            .or_default()
            .insert(conversation_id);
    }
}

fn slot(seq: i64) -> usize {
    (seq - 1).max(0) as usize
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn ensure_private(&self, conversation: Conversation) -> AppResult<Conversation> {
        let participants = match &conversation.kind {
            ConversationKind::Private { participants } => *participants,
            ConversationKind::Group { .. } => {
                return Err(AppError::BadRequest("expected a private conversation".into()))
            }
        };

        let stored = self
            .conversations
            .entry(conversation.id)
            .or_insert_with(|| ConversationEntry {
                members: participants.iter().copied().collect(),
                conversation,
            })
            .conversation
            .clone();

        for user in participants {
            self.index_membership(user, stored.id);
        }
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.conversations.get(&id).map(|e| e.conversation.clone()))
    }

    async fn create_group(&self, conversation: Conversation) -> AppResult<Conversation> {
        let (name, creator_id) = match &conversation.kind {
            ConversationKind::Group { name, creator_id } => (name.clone(), *creator_id),
            ConversationKind::Private { .. } => {
                return Err(AppError::BadRequest("expected a group conversation".into()))
            }
        };

        match self.group_names.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(AppError::AlreadyExists(Existing::GroupName(name.clone())));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(conversation.id);
            }
        }

        self.conversations.insert(
            conversation.id,
            ConversationEntry {
                conversation: conversation.clone(),
                members: BTreeSet::from([creator_id]),
            },
        );
        self.index_membership(creator_id, conversation.id);
        Ok(conversation)
    }

    async fn find_group(&self, name: &str) -> AppResult<Option<Conversation>> {
        let id = match self.group_names.get(name) {
            Some(id) => *id,
            None => return Ok(None),
        };
        ConversationStore::get(self, id).await
    }

    async fn add_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let added = {
            let mut entry = self
                .conversations
                .get_mut(&group_id)
                .ok_or(AppError::NotFound(Resource::Group))?;
            entry.members.insert(user_id)
        };
        if added {
            self.index_membership(user_id, group_id);
        }
        Ok(added)
    }

    async fn remove_member(&self, group_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        {
            let mut entry = self
                .conversations
                .get_mut(&group_id)
                .ok_or(AppError::NotFound(Resource::Group))?;
            if !entry.members.contains(&user_id) {
                return Ok(false);
            }
            if entry.members.len() == 1 {
                return Err(AppError::BadRequest(
                    "cannot remove the last member of a group".into(),
                ));
            }
            entry.members.remove(&user_id);
        }
        if let Some(mut joined) = self.memberships.get_mut(&user_id) {
            joined.remove(&group_id);
        }
        Ok(true)
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        Ok(self
            .conversations
            .get(&conversation_id)
            .map(|e| e.members.contains(&user_id))
            .unwrap_or(false))
    }

    async fn member_count(&self, conversation_id: Uuid) -> AppResult<usize> {
        Ok(self
            .conversations
            .get(&conversation_id)
            .map(|e| e.members.len())
            .unwrap_or(0))
    }

    async fn members_page(
        &self,
        conversation_id: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> AppResult<Vec<Uuid>> {
        let entry = match self.conversations.get(&conversation_id) {
            Some(entry) => entry,
            None => return Ok(Vec::new()),
        };
        let lower = match after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        Ok(entry
            .members
            .range((lower, Bound::Unbounded))
            .take(limit)
            .copied()
            .collect())
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let ids: Vec<Uuid> = match self.memberships.get(&user_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .into_iter()
            .filter_map(|id| self.conversations.get(&id).map(|e| e.conversation.clone()))
            .collect())
    }

    async fn create_invite(&self, invite: GroupInvite) -> AppResult<bool> {
        match self.invites.entry((invite.group_id, invite.invitee_id)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(invite);
                Ok(true)
            }
        }
    }

    async fn take_invite(
        &self,
        group_id: Uuid,
        invitee_id: Uuid,
    ) -> AppResult<Option<GroupInvite>> {
        Ok(self
            .invites
            .remove(&(group_id, invitee_id))
            .map(|(_, invite)| invite))
    }

    async fn invites_for(&self, invitee_id: Uuid) -> AppResult<Vec<GroupInvite>> {
        let mut invites: Vec<GroupInvite> = self
            .invites
            .iter()
            .filter(|e| e.key().1 == invitee_id)
            .map(|e| e.value().clone())
            .collect();
        invites.sort_by_key(|i| i.created_at);
        Ok(invites)
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append(&self, message: NewMessage, now: DateTime<Utc>) -> AppResult<AppendOutcome> {
        let log = self.log(message.conversation_id);
        let mut log = log.lock().await;

        if let Some(key) = &message.idempotency_key {
            if let Some(existing) = log
                .by_idempotency_key
                .get(key)
                .and_then(|idx| log.messages.get(*idx))
            {
                return Ok(AppendOutcome::Duplicate(existing.clone()));
            }
        }

        let seq = log.messages.len() as i64 + 1;
        let message = message.into_message(seq, now);
        if let Some(key) = &message.idempotency_key {
            let idx = log.messages.len();
            log.by_idempotency_key.insert(key.clone(), idx);
        }
        self.message_index
            .insert(message.id, (message.conversation_id, seq));
        log.messages.push(message.clone());

        Ok(AppendOutcome::Appended(message))
    }

    async fn read(&self, conversation_id: Uuid, range: HistoryRange) -> AppResult<Vec<Message>> {
        let log = match self.existing_log(conversation_id) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };
        let log = log.lock().await;
        let skip = range.floor_seq() as usize;
        Ok(log
            .messages
            .iter()
            .skip(skip)
            .take(range.limit())
            .cloned()
            .collect())
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let (conversation_id, seq) = match self.locate(message_id) {
            Some(location) => location,
            None => return Ok(None),
        };
        let log = match self.existing_log(conversation_id) {
            Some(log) => log,
            None => return Ok(None),
        };
        let log = log.lock().await;
        Ok(log.messages.get(slot(seq)).cloned())
    }

    async fn latest_seq(&self, conversation_id: Uuid) -> AppResult<i64> {
        match self.existing_log(conversation_id) {
            Some(log) => Ok(log.lock().await.messages.len() as i64),
            None => Ok(0),
        }
    }

    async fn update_body(
        &self,
        message_id: Uuid,
        body: String,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Message> {
        let (conversation_id, seq) = self
            .locate(message_id)
            .ok_or(AppError::NotFound(Resource::Message))?;
        let log = self
            .existing_log(conversation_id)
            .ok_or(AppError::NotFound(Resource::Message))?;
        let mut log = log.lock().await;
        let message = log
            .messages
            .get_mut(slot(seq))
            .ok_or(AppError::NotFound(Resource::Message))?;

        if message.is_deleted() {
            return Err(AppError::AlreadyDeleted);
        }
        message.body = body;
        message.edited_at = Some(edited_at);
        Ok(message.clone())
    }

    async fn tombstone(&self, message_id: Uuid, deleted_at: DateTime<Utc>) -> AppResult<Message> {
        let (conversation_id, seq) = self
            .locate(message_id)
            .ok_or(AppError::NotFound(Resource::Message))?;
        let log = self
            .existing_log(conversation_id)
            .ok_or(AppError::NotFound(Resource::Message))?;
        let mut log = log.lock().await;
        let message = log
            .messages
            .get_mut(slot(seq))
            .ok_or(AppError::NotFound(Resource::Message))?;

        if !message.is_deleted() {
            *message = message.clone().into_tombstone(deleted_at);
        }
        Ok(message.clone())
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryStore {
    async fn record_pending(&self, recipient_id: Uuid, message: &Message) -> AppResult<()> {
        self.receipts
            .entry((recipient_id, message.conversation_id))
            .or_default()
            .entry(message.seq)
            .or_insert(Receipt {
                message_id: message.id,
                state: DeliveryState::Pending,
            });
        Ok(())
    }

    async fn mark_delivered(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        message_ids: &[Uuid],
    ) -> AppResult<usize> {
        let wanted: HashSet<Uuid> = message_ids.iter().copied().collect();
        let mut receipts = match self.receipts.get_mut(&(recipient_id, conversation_id)) {
            Some(receipts) => receipts,
            None => return Ok(0),
        };
        let mut advanced = 0;
        for receipt in receipts.values_mut() {
            if receipt.state == DeliveryState::Pending && wanted.contains(&receipt.message_id) {
                receipt.state = DeliveryState::Delivered;
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    async fn delivery_state(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        seq: i64,
    ) -> AppResult<Option<DeliveryState>> {
        let key = (recipient_id, conversation_id);
        let cursor = self.read_cursors.get(&key).map(|c| *c).unwrap_or(0);
        if seq >= 1 && seq <= cursor {
            return Ok(Some(DeliveryState::Read));
        }
        Ok(self
            .receipts
            .get(&key)
            .and_then(|receipts| receipts.get(&seq).map(|r| r.state)))
    }

    async fn create_notification(&self, notification: Notification) -> AppResult<bool> {
        let mut pending = self
            .notifications
            .entry(notification.recipient_id)
            .or_default();
        match pending.entry(notification.message_id) {
            hash_map::Entry::Occupied(_) => Ok(false),
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(notification);
                Ok(true)
            }
        }
    }

    async fn pending_notifications(&self, recipient_id: Uuid) -> AppResult<Vec<Notification>> {
        let mut out: Vec<Notification> = match self.notifications.get(&recipient_id) {
            Some(pending) => pending.values().cloned().collect(),
            None => Vec::new(),
        };
        out.sort_by(|a, b| {
            (a.created_at, a.conversation_id, a.seq).cmp(&(b.created_at, b.conversation_id, b.seq))
        });
        Ok(out)
    }

    async fn pending_for_conversation(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<Vec<Notification>> {
        let mut out: Vec<Notification> = match self.notifications.get(&recipient_id) {
            Some(pending) => pending
                .values()
                .filter(|n| n.conversation_id == conversation_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        out.sort_by_key(|n| n.seq);
        Ok(out)
    }

    async fn mark_read(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<ReadOutcome> {
        let key = (recipient_id, conversation_id);
        let last_read_seq = {
            let mut cursor = self.read_cursors.entry(key).or_insert(0);
            *cursor = (*cursor).max(up_to_seq);
            *cursor
        };

        if let Some(mut receipts) = self.receipts.get_mut(&key) {
            for receipt in receipts.range_mut(..=last_read_seq).map(|(_, r)| r) {
                receipt.state = DeliveryState::Read;
            }
        }

        let cleared = match self.notifications.get_mut(&recipient_id) {
            Some(mut pending) => {
                let before = pending.len();
                pending.retain(|_, n| !(n.conversation_id == conversation_id && n.seq <= last_read_seq));
                before - pending.len()
            }
            None => 0,
        };

        Ok(ReadOutcome {
            last_read_seq,
            cleared,
        })
    }

    async fn last_read_seq(&self, recipient_id: Uuid, conversation_id: Uuid) -> AppResult<i64> {
        Ok(self
            .read_cursors
            .get(&(recipient_id, conversation_id))
            .map(|c| *c)
            .unwrap_or(0))
    }

    async fn settled_seqs(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        after_seq: i64,
        up_to_seq: i64,
    ) -> AppResult<HashSet<i64>> {
        let mut settled = HashSet::new();
        if after_seq >= up_to_seq {
            return Ok(settled);
        }

        if let Some(pending) = self.notifications.get(&recipient_id) {
            settled.extend(
                pending
                    .values()
                    .filter(|n| n.conversation_id == conversation_id)
                    .filter(|n| n.seq > after_seq && n.seq <= up_to_seq)
                    .map(|n| n.seq),
            );
        }
        if let Some(receipts) = self.receipts.get(&(recipient_id, conversation_id)) {
            settled.extend(
                receipts
                    .range(after_seq + 1..=up_to_seq)
                    .filter(|(_, r)| r.state >= DeliveryState::Delivered)
                    .map(|(seq, _)| *seq),
            );
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(conversation_id: Uuid, sender_id: Uuid, body: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            sender_id,
            body: body.to_string(),
            attachment_ref: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_are_per_conversation() {
        let store = InMemoryStore::new();
        let (c1, c2, sender) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let a = store.append(draft(c1, sender, "a"), Utc::now()).await.unwrap();
        let b = store.append(draft(c1, sender, "b"), Utc::now()).await.unwrap();
        let c = store.append(draft(c2, sender, "c"), Utc::now()).await.unwrap();

        assert_eq!(a.message().seq, 1);
        assert_eq!(b.message().seq, 2);
        assert_eq!(c.message().seq, 1);
        assert_eq!(store.latest_seq(c1).await.unwrap(), 2);
        assert_eq!(store.latest_seq(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idempotency_key_returns_original_message() {
        let store = InMemoryStore::new();
        let (conv, sender) = (Uuid::new_v4(), Uuid::new_v4());
        let mut first = draft(conv, sender, "hello");
        first.idempotency_key = Some("client-1".into());

        let original = store.append(first.clone(), Utc::now()).await.unwrap();
        let retry = store.append(first, Utc::now()).await.unwrap();

        assert!(retry.is_duplicate());
        assert_eq!(retry.message().id, original.message().id);
        assert_eq!(store.latest_seq(conv).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn read_after_seq_and_offset() {
        let store = InMemoryStore::new();
        let (conv, sender) = (Uuid::new_v4(), Uuid::new_v4());
        for i in 0..5 {
            store
                .append(draft(conv, sender, &format!("m{i}")), Utc::now())
                .await
                .unwrap();
        }

        let after = store
            .read(conv, HistoryRange::After { after_seq: 3, limit: 10 })
            .await
            .unwrap();
        assert_eq!(after.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4, 5]);

        let page = store
            .read(conv, HistoryRange::Offset { skip: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn tombstone_blocks_edits_and_is_idempotent() {
        let store = InMemoryStore::new();
        let (conv, sender) = (Uuid::new_v4(), Uuid::new_v4());
        let msg = store
            .append(draft(conv, sender, "oops"), Utc::now())
            .await
            .unwrap()
            .into_message();

        let tomb = store.tombstone(msg.id, Utc::now()).await.unwrap();
        assert!(tomb.is_deleted());
        assert_eq!(tomb.seq, msg.seq);

        let again = store.tombstone(msg.id, Utc::now()).await.unwrap();
        assert_eq!(again.deleted_at, tomb.deleted_at);

        let err = store
            .update_body(msg.id, "fixed".into(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyDeleted));
    }

    #[tokio::test]
    async fn last_member_cannot_leave() {
        let store = InMemoryStore::new();
        let creator = Uuid::new_v4();
        let group = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Group {
                name: "solo".into(),
                creator_id: creator,
            },
            created_at: Utc::now(),
        };
        store.create_group(group.clone()).await.unwrap();

        let err = store.remove_member(group.id, creator).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(store.is_member(group.id, creator).await.unwrap());
    }

    #[tokio::test]
    async fn notifications_are_unique_per_recipient_and_message() {
        let store = InMemoryStore::new();
        let (conv, sender, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let msg = store
            .append(draft(conv, sender, "hi"), Utc::now())
            .await
            .unwrap()
            .into_message();

        let n = Notification::for_message(bob, &msg, Utc::now());
        assert!(store.create_notification(n.clone()).await.unwrap());
        assert!(!store.create_notification(n).await.unwrap());
        assert_eq!(store.pending_notifications(bob).await.unwrap().len(), 1);

        let outcome = store.mark_read(bob, conv, msg.seq).await.unwrap();
        assert_eq!(outcome.cleared, 1);
        assert!(store.pending_notifications(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_cursor_never_moves_backwards() {
        let store = InMemoryStore::new();
        let (bob, conv) = (Uuid::new_v4(), Uuid::new_v4());
        store.mark_read(bob, conv, 7).await.unwrap();
        let outcome = store.mark_read(bob, conv, 3).await.unwrap();
        assert_eq!(outcome.last_read_seq, 7);
        assert_eq!(store.last_read_seq(bob, conv).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn delivered_receipts_count_as_settled() {
        let store = InMemoryStore::new();
        let (conv, sender, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let m1 = store
            .append(draft(conv, sender, "one"), Utc::now())
            .await
            .unwrap()
            .into_message();
        let m2 = store
            .append(draft(conv, sender, "two"), Utc::now())
            .await
            .unwrap()
            .into_message();

        store.record_pending(bob, &m1).await.unwrap();
        store.record_pending(bob, &m2).await.unwrap();
        assert_eq!(store.mark_delivered(bob, conv, &[m1.id]).await.unwrap(), 1);

        let settled = store.settled_seqs(bob, conv, 0, 2).await.unwrap();
        assert!(settled.contains(&1));
        assert!(!settled.contains(&2));
        assert_eq!(
            store.delivery_state(bob, conv, 2).await.unwrap(),
            Some(DeliveryState::Pending)
        );
    }
}
