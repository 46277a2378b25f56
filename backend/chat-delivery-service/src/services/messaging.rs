use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    Conversation, ConversationSummary, DeliveryState, GroupInvite, HistoryRange, Message,
    NewMessage, Notification, SendTarget,
};
use crate::services::conversation_service::ConversationResolver;
use crate::services::delivery_ledger::{DeliveryLedger, ReadOutcome};
use crate::services::dispatcher::{
    DeliveryContext, DispatchMode, FanoutDispatcher, NotifySource,
};
use crate::services::message_store::MessageLog;
use crate::services::{Backends, CoreSettings};
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::{SubscriptionRegistry, SubscriptionToken};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Page size used when the caller does not ask for one
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub target: SendTarget,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachment_ref: Option<String>,
    /// Client-chosen key; resending with the same key returns the first message
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl SendRequest {
    pub fn text(target: SendTarget, body: impl Into<String>) -> Self {
        Self {
            target,
            body: body.into(),
            attachment_ref: None,
            idempotency_key: None,
        }
    }
}

/// What happened to recipients after the append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Every recipient was pushed to or notified before returning
    Delivered,
    /// Handed to a background fan-out worker
    Queued,
    /// Fan-out failed after the append; recipients recover it on reconnect
    Deferred,
    /// Duplicate send; the original already went out
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub duplicate: bool,
    pub delivery: DeliveryStatus,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryQuery {
    /// Cursor: only messages with a larger seq
    pub after_seq: Option<i64>,
    /// Offset paging; ignored when `after_seq` is set
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn after(after_seq: i64, limit: usize) -> Self {
        Self {
            after_seq: Some(after_seq),
            skip: None,
            limit: Some(limit),
        }
    }

    fn range(&self) -> HistoryRange {
        let limit = self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        match (self.after_seq, self.skip) {
            (None, Some(skip)) => HistoryRange::Offset { skip, limit },
            (after_seq, _) => HistoryRange::After {
                after_seq: after_seq.unwrap_or(0),
                limit,
            },
        }
    }
}

/// A live subscription plus everything the client missed.
pub struct Subscription {
    pub token: SubscriptionToken,
    pub conversation_id: Uuid,
    pub receiver: UnboundedReceiver<WsOutboundEvent>,
    /// Pending notifications for this conversation, oldest first
    pub backlog: Vec<Notification>,
    pub latest_seq: i64,
    pub last_read_seq: i64,
}

/// The delivery core: every operation clients can invoke, independent of
/// transport.
#[derive(Clone)]
pub struct MessagingCore {
    conversations: ConversationResolver,
    messages: MessageLog,
    ledger: Arc<dyn DeliveryLedger>,
    registry: SubscriptionRegistry,
    dispatcher: FanoutDispatcher,
    clock: Arc<dyn Clock>,
}

impl MessagingCore {
    /// Build the core and start its fan-out workers on the current runtime.
    pub fn new(backends: Backends, clock: Arc<dyn Clock>, settings: CoreSettings) -> Self {
        let registry = SubscriptionRegistry::new(settings.subscription_ttl);
        let ctx = Arc::new(DeliveryContext {
            conversations: backends.conversations.clone(),
            messages: backends.messages.clone(),
            ledger: backends.ledger.clone(),
            registry: registry.clone(),
            clock: clock.clone(),
            settings: settings.fanout,
        });

        Self {
            conversations: ConversationResolver::new(backends.conversations),
            messages: MessageLog::new(
                backends.messages,
                clock.clone(),
                settings.edit_window,
                settings.history_max_limit,
            ),
            ledger: backends.ledger,
            registry,
            dispatcher: FanoutDispatcher::start(ctx),
            clock,
        }
    }

    pub fn conversations(&self) -> &ConversationResolver {
        &self.conversations
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &FanoutDispatcher {
        &self.dispatcher
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn send(&self, sender: Uuid, request: SendRequest) -> AppResult<SendReceipt> {
        let conversation = self
            .conversations
            .resolve_target(sender, &request.target, self.clock.now())
            .await?;

        let draft = NewMessage {
            conversation_id: conversation.id,
            sender_id: sender,
            body: request.body,
            attachment_ref: request.attachment_ref,
            idempotency_key: request.idempotency_key,
        };
        draft.validate()?;

        let lane = self.dispatcher.enter(conversation.id).await;
        let outcome = self.messages.append(draft).await?;
        if outcome.is_duplicate() {
            drop(lane);
            let message = outcome.into_message();
            tracing::debug!(message_id = %message.id, "duplicate send suppressed");
            return Ok(receipt(&message, true, DeliveryStatus::Skipped));
        }

        let message = outcome.into_message();
        metrics::record_message_appended();
        self.advance_sender_cursor(sender, &message).await;

        let delivery = match self.dispatcher.dispatch(lane, message.clone()).await {
            Ok(DispatchMode::Inline(_)) => DeliveryStatus::Delivered,
            Ok(DispatchMode::Queued) => DeliveryStatus::Queued,
            Err(e) => {
                metrics::record_fanout_failure();
                tracing::error!(
                    error = %e,
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    "fan-out failed after append"
                );
                DeliveryStatus::Deferred
            }
        };

        tracing::info!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            seq = message.seq,
            sender_id = %sender,
            ?delivery,
            "message sent"
        );
        Ok(receipt(&message, false, delivery))
    }

    /// A sender who was caught up stays caught up after posting.
    async fn advance_sender_cursor(&self, sender: Uuid, message: &Message) {
        let result = async {
            let last_read = self
                .ledger
                .last_read_seq(sender, message.conversation_id)
                .await?;
            if last_read == message.seq - 1 {
                self.ledger
                    .mark_read(sender, message.conversation_id, message.seq)
                    .await?;
            }
            Ok::<_, AppError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, sender_id = %sender, "failed to advance sender read cursor");
        }
    }

    pub async fn history(
        &self,
        requester: Uuid,
        conversation_id: Uuid,
        query: HistoryQuery,
    ) -> AppResult<Vec<Message>> {
        let conversation = self.conversations.accessible(conversation_id, requester).await?;
        self.messages.read(conversation.id, query.range()).await
    }

    /// Every message after `after_seq`, lazily paged from the store.
    pub async fn history_stream(
        &self,
        requester: Uuid,
        conversation_id: Uuid,
        after_seq: i64,
    ) -> AppResult<BoxStream<'static, AppResult<Message>>> {
        let conversation = self.conversations.accessible(conversation_id, requester).await?;
        self.messages.stream_from(conversation.id, after_seq).await
    }

    pub async fn edit(&self, editor: Uuid, message_id: Uuid, body: String) -> AppResult<Message> {
        let message = self.messages.edit(editor, message_id, body).await?;
        tracing::info!(%message_id, editor_id = %editor, "message edited");

        let event = WsOutboundEvent::MessageEdited {
            message: message.clone(),
        };
        self.broadcast(message.conversation_id, &event).await?;
        Ok(message)
    }

    pub async fn delete(&self, requester: Uuid, message_id: Uuid) -> AppResult<Message> {
        let (message, changed) = self.messages.delete(requester, message_id).await?;
        if changed {
            tracing::info!(%message_id, requester_id = %requester, "message deleted");
            let event = WsOutboundEvent::MessageDeleted {
                conversation_id: message.conversation_id,
                message_id: message.id,
                seq: message.seq,
            };
            self.broadcast(message.conversation_id, &event).await?;
        }
        Ok(message)
    }

    async fn broadcast(&self, conversation_id: Uuid, event: &WsOutboundEvent) -> AppResult<()> {
        let outcome = self
            .registry
            .broadcast(conversation_id, event, None, self.clock.now());
        if !outcome.orphans.is_empty() {
            self.dispatcher
                .context()
                .notify_orphans(outcome.orphans)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions and acknowledgments
    // ------------------------------------------------------------------

    /// Start live delivery for `recipient` and return what they missed.
    ///
    /// The subscription is registered before reconciling, so a message
    /// appended meanwhile is either pushed to it or already settled.
    pub async fn subscribe(&self, recipient: Uuid, conversation_id: Uuid) -> AppResult<Subscription> {
        let conversation = self.conversations.accessible(conversation_id, recipient).await?;
        let (token, receiver) = self
            .registry
            .subscribe(recipient, conversation.id, self.clock.now());

        let snapshot = async {
            // A dropped session keeps its subscription until the TTL runs
            // out; whatever it still had in flight belongs to this one now.
            let stale = self.registry.reap_closed(recipient, conversation.id);
            if !stale.is_empty() {
                self.dispatcher.context().notify_orphans(stale).await?;
            }
            self.reconcile(recipient, conversation.id).await?;
            let backlog = self
                .ledger
                .pending_for_conversation(recipient, conversation.id)
                .await?;
            let latest_seq = self.messages.latest_seq(conversation.id).await?;
            let last_read_seq = self.ledger.last_read_seq(recipient, conversation.id).await?;
            Ok::<_, AppError>((backlog, latest_seq, last_read_seq))
        }
        .await;

        match snapshot {
            Ok((backlog, latest_seq, last_read_seq)) => Ok(Subscription {
                token,
                conversation_id: conversation.id,
                receiver,
                backlog,
                latest_seq,
                last_read_seq,
            }),
            Err(e) => {
                self.registry.unsubscribe(token);
                Err(e)
            }
        }
    }

    pub fn heartbeat(&self, token: SubscriptionToken) -> bool {
        self.registry.heartbeat(token, self.clock.now())
    }

    /// End a subscription. Pushed messages it never acknowledged become
    /// notifications; returns how many.
    pub async fn unsubscribe(&self, token: SubscriptionToken) -> AppResult<usize> {
        let orphans = self.registry.unsubscribe(token);
        if orphans.is_empty() {
            return Ok(0);
        }
        self.dispatcher.context().notify_orphans(orphans).await
    }

    /// Expire subscriptions that stopped heartbeating.
    pub async fn sweep_expired(&self) -> AppResult<usize> {
        let orphans = self.registry.sweep_expired(self.clock.now());
        if orphans.is_empty() {
            return Ok(0);
        }
        self.dispatcher.context().notify_orphans(orphans).await
    }

    /// Client confirms receipt of pushed messages.
    pub async fn ack_delivered(
        &self,
        recipient: Uuid,
        conversation_id: Uuid,
        message_ids: &[Uuid],
    ) -> AppResult<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        self.registry
            .acknowledge(recipient, conversation_id, message_ids);
        self.ledger
            .mark_delivered(recipient, conversation_id, message_ids)
            .await
    }

    /// Everything up to `up_to_seq` has been read. Clears the matching
    /// notifications.
    pub async fn ack_read(
        &self,
        recipient: Uuid,
        conversation_id: Uuid,
        up_to_seq: i64,
    ) -> AppResult<ReadOutcome> {
        if up_to_seq < 0 {
            return Err(AppError::BadRequest("up_to_seq must be >= 0".into()));
        }
        let conversation = self.conversations.accessible(conversation_id, recipient).await?;
        let latest = self.messages.latest_seq(conversation.id).await?;
        let up_to_seq = up_to_seq.min(latest);

        self.registry
            .acknowledge_through(recipient, conversation.id, up_to_seq);
        let outcome = self
            .ledger
            .mark_read(recipient, conversation.id, up_to_seq)
            .await?;

        let event = WsOutboundEvent::ReadAcknowledged {
            conversation_id: conversation.id,
            last_read_seq: outcome.last_read_seq,
        };
        self.registry
            .push_control(recipient, conversation.id, &event, self.clock.now());

        tracing::debug!(
            recipient_id = %recipient,
            conversation_id = %conversation.id,
            last_read_seq = outcome.last_read_seq,
            cleared = outcome.cleared,
            "read acknowledged"
        );
        Ok(outcome)
    }

    /// Create notifications for messages the recipient should have been told
    /// about but never was, e.g. after a crash between append and fan-out.
    pub async fn reconcile(&self, recipient: Uuid, conversation_id: Uuid) -> AppResult<usize> {
        let last_read = self.ledger.last_read_seq(recipient, conversation_id).await?;
        let latest = self.messages.latest_seq(conversation_id).await?;
        if latest <= last_read {
            return Ok(0);
        }

        let settled = self
            .ledger
            .settled_seqs(recipient, conversation_id, last_read, latest)
            .await?;
        let in_flight = self.registry.in_flight(recipient, conversation_id);
        let ctx = self.dispatcher.context();
        let now = self.clock.now();

        let mut missed = self.messages.stream_from(conversation_id, last_read).await?;
        let mut created = 0;
        while let Some(message) = missed.try_next().await? {
            if message.sender_id == recipient
                || message.is_deleted()
                || settled.contains(&message.seq)
                || in_flight.contains(&message.id)
            {
                continue;
            }
            self.ledger.record_pending(recipient, &message).await?;
            let notification = Notification::for_message(recipient, &message, now);
            if ctx.notify(notification, NotifySource::Reconciled).await? {
                created += 1;
            }
        }

        if created > 0 {
            tracing::info!(
                recipient_id = %recipient,
                %conversation_id,
                created,
                "reconciled missing notifications"
            );
        }
        Ok(created)
    }

    /// Where a message stands for one recipient. `None` when it was never
    /// addressed to them (e.g. their own message).
    pub async fn delivery_state(
        &self,
        recipient: Uuid,
        message_id: Uuid,
    ) -> AppResult<Option<DeliveryState>> {
        let message = self.messages.get(message_id).await?;
        self.conversations
            .accessible(message.conversation_id, recipient)
            .await?;
        if message.sender_id == recipient {
            return Ok(None);
        }
        self.ledger
            .delivery_state(recipient, message.conversation_id, message.seq)
            .await
    }

    /// Polling fallback: every pending notification of the recipient.
    pub async fn pending_notifications(&self, recipient: Uuid) -> AppResult<Vec<Notification>> {
        self.ledger.pending_notifications(recipient).await
    }

    // ------------------------------------------------------------------
    // Conversations and groups
    // ------------------------------------------------------------------

    pub async fn open_private(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        self.conversations.open_private(a, b, self.clock.now()).await
    }

    pub async fn create_group(&self, name: &str, creator: Uuid) -> AppResult<Conversation> {
        self.conversations
            .create_group(name, creator, self.clock.now())
            .await
    }

    pub async fn resolve_group(&self, name: &str) -> AppResult<Conversation> {
        self.conversations.resolve_group(name).await
    }

    pub async fn add_member(&self, group_id: Uuid, requester: Uuid, user: Uuid) -> AppResult<bool> {
        let added = self
            .conversations
            .add_member(group_id, requester, user)
            .await?;
        if added {
            self.start_cursor_at_latest(user, group_id).await?;
        }
        Ok(added)
    }

    pub async fn remove_member(&self, group_id: Uuid, requester: Uuid, user: Uuid) -> AppResult<bool> {
        let removed = self
            .conversations
            .remove_member(group_id, requester, user)
            .await?;
        if removed {
            // Former members get nothing further, not even notifications.
            let dropped = self.registry.unsubscribe_recipient(user, group_id);
            tracing::info!(
                %group_id,
                user_id = %user,
                unacknowledged = dropped.len(),
                "member removed, live subscriptions closed"
            );
        }
        Ok(removed)
    }

    pub async fn members(
        &self,
        group_id: Uuid,
        requester: Uuid,
        after: Option<Uuid>,
        limit: usize,
    ) -> AppResult<Vec<Uuid>> {
        self.conversations
            .members_page(group_id, requester, after, limit.clamp(1, 1000))
            .await
    }

    pub async fn invite(&self, group_id: Uuid, inviter: Uuid, invitee: Uuid) -> AppResult<GroupInvite> {
        self.conversations
            .invite(group_id, inviter, invitee, self.clock.now())
            .await
    }

    pub async fn accept_invite(&self, group_id: Uuid, invitee: Uuid) -> AppResult<Conversation> {
        let group = self.conversations.accept_invite(group_id, invitee).await?;
        self.start_cursor_at_latest(invitee, group.id).await?;
        Ok(group)
    }

    pub async fn decline_invite(&self, group_id: Uuid, invitee: Uuid) -> AppResult<()> {
        self.conversations.decline_invite(group_id, invitee).await
    }

    pub async fn pending_invites(&self, invitee: Uuid) -> AppResult<Vec<GroupInvite>> {
        self.conversations.pending_invites(invitee).await
    }

    /// Conversations the user takes part in; most unread first, then newest.
    pub async fn conversations_for(&self, user: Uuid) -> AppResult<Vec<ConversationSummary>> {
        let conversations = self.conversations.conversations_for(user).await?;
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let latest = self.messages.latest_seq(conversation.id).await?;
            let last_read = self.ledger.last_read_seq(user, conversation.id).await?;
            summaries.push(ConversationSummary::new(conversation, latest, last_read));
        }
        summaries.sort_by(|a, b| {
            b.unread
                .cmp(&a.unread)
                .then(b.conversation.created_at.cmp(&a.conversation.created_at))
        });
        Ok(summaries)
    }

    /// New members are not notified about messages from before they joined.
    async fn start_cursor_at_latest(&self, user: Uuid, conversation_id: Uuid) -> AppResult<()> {
        let latest = self.messages.latest_seq(conversation_id).await?;
        if latest > 0 {
            self.ledger.mark_read(user, conversation_id, latest).await?;
        }
        Ok(())
    }
}

fn receipt(message: &Message, duplicate: bool, delivery: DeliveryStatus) -> SendReceipt {
    SendReceipt {
        message_id: message.id,
        conversation_id: message.conversation_id,
        seq: message.seq,
        created_at: message.created_at,
        duplicate,
        delivery,
    }
}
