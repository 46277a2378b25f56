//! Fan-out of appended messages to recipients.
//!
//! Every conversation has a lane: a mutex held from append until the message
//! is either pushed or handed to a worker, plus a count of messages still
//! queued for that conversation. Small conversations are fanned out inline
//! while the lane is held. Large ones go to a fixed worker pool, sharded by
//! conversation id, so messages of one conversation always reach one worker
//! in seq order. Once a conversation has queued work, later messages queue
//! behind it even if they would qualify for inline delivery. A lane nobody
//! holds and with nothing queued is dropped from the table.

use crate::clock::Clock;
use crate::error::{AppError, AppResult, Resource};
use crate::metrics;
use crate::models::{ConversationKind, DeliveryState, Message, Notification};
use crate::services::conversation_service::ConversationStore;
use crate::services::delivery_ledger::DeliveryLedger;
use crate::services::message_store::MessageStore;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::{Orphan, SubscriptionRegistry};
use dashmap::DashMap;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct FanoutSettings {
    pub batch_size: usize,
    pub inline_limit: usize,
    pub workers: usize,
}

/// How a message left the lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Inline(FanoutReport),
    Queued,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub recipients: usize,
    pub pushed: usize,
    pub notified: usize,
}

#[derive(Default)]
struct Lane {
    order: Arc<Mutex<()>>,
    // guards taken or waiting
    holders: AtomicUsize,
    queued: AtomicUsize,
    idle: Notify,
}

impl Lane {
    fn finish_one(&self) {
        if self.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.load(Ordering::Acquire) == 0 && self.queued.load(Ordering::Acquire) == 0
    }
}

/// Lanes of conversations with a send in progress or fan-out queued.
#[derive(Clone, Default)]
struct LaneTable(Arc<DashMap<Uuid, Arc<Lane>>>);

impl LaneTable {
    fn enter(&self, conversation_id: Uuid) -> Arc<Lane> {
        let lane = self.0.entry(conversation_id).or_default();
        lane.holders.fetch_add(1, Ordering::AcqRel);
        lane.clone()
    }

    fn get(&self, conversation_id: Uuid) -> Option<Arc<Lane>> {
        self.0.get(&conversation_id).map(|lane| lane.clone())
    }

    /// Called after every release. Holders are only added under the map
    /// lock, so a lane seen idle here cannot be entered concurrently.
    fn evict_if_idle(&self, conversation_id: Uuid) {
        self.0.remove_if(&conversation_id, |_, lane| lane.is_idle());
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Exclusive hold on a conversation lane. Appends happen under it so that
/// sequence order and delivery order agree.
pub struct LaneGuard {
    conversation_id: Uuid,
    lane: Arc<Lane>,
    lanes: LaneTable,
    order: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        self.order.take();
        self.lane.holders.fetch_sub(1, Ordering::AcqRel);
        self.lanes.evict_if_idle(self.conversation_id);
    }
}

struct FanoutJob {
    message: Message,
    lane: Arc<Lane>,
}

/// Reason a notification was created, used as a metrics label.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NotifySource {
    Offline,
    Orphaned,
    Reconciled,
}

impl NotifySource {
    fn as_str(&self) -> &'static str {
        match self {
            NotifySource::Offline => "offline",
            NotifySource::Orphaned => "orphaned",
            NotifySource::Reconciled => "reconciled",
        }
    }
}

pub(crate) struct DeliveryContext {
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
    pub ledger: Arc<dyn DeliveryLedger>,
    pub registry: SubscriptionRegistry,
    pub clock: Arc<dyn Clock>,
    pub settings: FanoutSettings,
}

impl DeliveryContext {
    async fn fan_out(&self, message: &Message) -> AppResult<FanoutReport> {
        let started = Instant::now();
        let conversation = self
            .conversations
            .get(message.conversation_id)
            .await?
            .ok_or(AppError::NotFound(Resource::Conversation))?;

        let mut report = FanoutReport::default();
        match &conversation.kind {
            ConversationKind::Private { .. } => {
                if let Some(recipient) = conversation.counterpart(message.sender_id) {
                    self.deliver_to(recipient, message, &mut report).await?;
                }
            }
            ConversationKind::Group { .. } => {
                let mut after = None;
                loop {
                    let page = self
                        .conversations
                        .members_page(conversation.id, after, self.settings.batch_size)
                        .await?;
                    let Some(last) = page.last().copied() else {
                        break;
                    };
                    for recipient in page.into_iter().filter(|r| *r != message.sender_id) {
                        self.deliver_to(recipient, message, &mut report).await?;
                    }
                    after = Some(last);
                    tokio::task::yield_now().await;
                }
            }
        }

        metrics::observe_fanout_duration(started.elapsed());
        tracing::debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            seq = message.seq,
            recipients = report.recipients,
            pushed = report.pushed,
            notified = report.notified,
            "fan-out complete"
        );
        Ok(report)
    }

    async fn deliver_to(
        &self,
        recipient: Uuid,
        message: &Message,
        report: &mut FanoutReport,
    ) -> AppResult<()> {
        report.recipients += 1;
        self.ledger.record_pending(recipient, message).await?;

        let now = self.clock.now();
        let event = WsOutboundEvent::Message {
            message: message.clone(),
        };
        let outcome = self.registry.push(
            recipient,
            message.conversation_id,
            &event,
            message.id,
            message.seq,
            now,
        );
        if !outcome.orphans.is_empty() {
            report.notified += self.notify_orphans(outcome.orphans).await?;
        }

        if outcome.delivered > 0 {
            report.pushed += 1;
        } else {
            let notification = Notification::for_message(recipient, message, now);
            if self.notify(notification, NotifySource::Offline).await? {
                report.notified += 1;
            }
        }
        Ok(())
    }

    pub(crate) async fn notify(
        &self,
        notification: Notification,
        source: NotifySource,
    ) -> AppResult<bool> {
        let created = self.ledger.create_notification(notification).await?;
        if created {
            metrics::record_notification_created(source.as_str());
        }
        Ok(created)
    }

    /// Turn pushed-but-unacknowledged messages into notifications, unless the
    /// recipient already confirmed them some other way.
    pub(crate) async fn notify_orphans(&self, orphans: Vec<Orphan>) -> AppResult<usize> {
        let now = self.clock.now();
        let mut cache: HashMap<Uuid, Option<Message>> = HashMap::new();
        let mut created = 0;

        for orphan in orphans {
            let state = self
                .ledger
                .delivery_state(orphan.recipient_id, orphan.conversation_id, orphan.seq)
                .await?;
            if state.map(|s| s > DeliveryState::Pending).unwrap_or(false) {
                continue;
            }

            if !cache.contains_key(&orphan.message_id) {
                let message = self.messages.get(orphan.message_id).await?;
                cache.insert(orphan.message_id, message);
            }
            let Some(Some(message)) = cache.get(&orphan.message_id) else {
                continue;
            };
            if message.is_deleted() {
                continue;
            }

            let notification = Notification::for_message(orphan.recipient_id, message, now);
            if self.notify(notification, NotifySource::Orphaned).await? {
                created += 1;
            }
        }
        Ok(created)
    }
}

/// Routes appended messages to recipients, inline or through workers.
#[derive(Clone)]
pub struct FanoutDispatcher {
    ctx: Arc<DeliveryContext>,
    lanes: LaneTable,
    workers: Arc<Vec<mpsc::UnboundedSender<FanoutJob>>>,
}

impl FanoutDispatcher {
    /// Spawns the worker pool on the current tokio runtime.
    pub(crate) fn start(ctx: Arc<DeliveryContext>) -> Self {
        let worker_count = ctx.settings.workers.max(1);
        let lanes = LaneTable::default();
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let (tx, mut rx) = mpsc::unbounded_channel::<FanoutJob>();
            let ctx = ctx.clone();
            let lanes = lanes.clone();
            tokio::spawn(async move {
                while let Some(FanoutJob { message, lane }) = rx.recv().await {
                    if let Err(e) = ctx.fan_out(&message).await {
                        metrics::record_fanout_failure();
                        tracing::error!(
                            worker_id,
                            error = %e,
                            message_id = %message.id,
                            conversation_id = %message.conversation_id,
                            "background fan-out failed; reconciliation will recover it"
                        );
                    }
                    lane.finish_one();
                    lanes.evict_if_idle(message.conversation_id);
                }
                tracing::debug!(worker_id, "fan-out worker stopped");
            });
            workers.push(tx);
        }

        Self {
            ctx,
            lanes,
            workers: Arc::new(workers),
        }
    }

    pub(crate) fn context(&self) -> &Arc<DeliveryContext> {
        &self.ctx
    }

    /// Wait for exclusive use of the conversation's lane.
    pub async fn enter(&self, conversation_id: Uuid) -> LaneGuard {
        // Built before waiting so a cancelled send still releases the lane.
        let mut guard = LaneGuard {
            conversation_id,
            lane: self.lanes.enter(conversation_id),
            lanes: self.lanes.clone(),
            order: None,
        };
        guard.order = Some(guard.lane.order.clone().lock_owned().await);
        guard
    }

    /// Deliver a freshly appended message and release the lane.
    pub async fn dispatch(&self, guard: LaneGuard, message: Message) -> AppResult<DispatchMode> {
        let recipients = self.recipient_estimate(&message).await?;

        if guard.lane.queued.load(Ordering::Acquire) == 0
            && recipients <= self.ctx.settings.inline_limit
        {
            let report = self.ctx.fan_out(&message).await?;
            drop(guard);
            return Ok(DispatchMode::Inline(report));
        }

        guard.lane.queued.fetch_add(1, Ordering::AcqRel);
        let worker = &self.workers[self.shard(message.conversation_id)];
        let job = FanoutJob {
            message,
            lane: guard.lane.clone(),
        };
        if let Err(mpsc::error::SendError(job)) = worker.send(job) {
            tracing::warn!(
                conversation_id = %job.message.conversation_id,
                "fan-out worker gone, delivering inline"
            );
            let result = self.ctx.fan_out(&job.message).await;
            job.lane.finish_one();
            drop(guard);
            return result.map(DispatchMode::Inline);
        }
        drop(guard);
        Ok(DispatchMode::Queued)
    }

    /// Lanes currently in the table.
    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Resolves once no fan-out is queued for the conversation.
    pub async fn wait_idle(&self, conversation_id: Uuid) {
        let lane = match self.lanes.get(conversation_id) {
            Some(lane) => lane,
            None => return,
        };
        loop {
            let idle = lane.idle.notified();
            if lane.queued.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    async fn recipient_estimate(&self, message: &Message) -> AppResult<usize> {
        let conversation = self
            .ctx
            .conversations
            .get(message.conversation_id)
            .await?
            .ok_or(AppError::NotFound(Resource::Conversation))?;
        match conversation.kind {
            ConversationKind::Private { .. } => Ok(1),
            ConversationKind::Group { .. } => Ok(self
                .ctx
                .conversations
                .member_count(conversation.id)
                .await?
                .saturating_sub(1)),
        }
    }

    fn shard(&self, conversation_id: Uuid) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        conversation_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.workers.len()
    }
}
