use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::metrics;
use message_types::WsOutboundEvent;

pub mod message_types;

/// Unacknowledged pushes remembered per subscription. Older ones spill into
/// notifications.
pub const MAX_IN_FLIGHT: usize = 512;

/// Unique identifier for a push subscription
///
/// Each connection gets its own token, so one user on several devices holds
/// several independent subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionToken(Uuid);

impl SubscriptionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A pushed message whose subscription went away before it was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orphan {
    pub recipient_id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub seq: i64,
}

#[derive(Debug, Default)]
pub struct PushOutcome {
    /// Subscriptions that accepted the event
    pub delivered: usize,
    /// In-flight messages of subscriptions dropped during the push
    pub orphans: Vec<Orphan>,
}

struct Subscriber {
    token: SubscriptionToken,
    recipient_id: Uuid,
    sender: UnboundedSender<WsOutboundEvent>,
    last_seen: DateTime<Utc>,
    // seq -> message id
    in_flight: BTreeMap<i64, Uuid>,
}

impl Subscriber {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now > self.last_seen + ttl
    }

    /// Remember a pushed message; returns the one evicted on overflow.
    fn track(&mut self, seq: i64, message_id: Uuid) -> Option<(i64, Uuid)> {
        self.in_flight.insert(seq, message_id);
        if self.in_flight.len() > MAX_IN_FLIGHT {
            self.in_flight.pop_first()
        } else {
            None
        }
    }

    fn into_orphans(self, conversation_id: Uuid) -> impl Iterator<Item = Orphan> {
        let recipient_id = self.recipient_id;
        self.in_flight
            .into_iter()
            .map(move |(seq, message_id)| Orphan {
                recipient_id,
                conversation_id,
                message_id,
                seq,
            })
    }
}

/// Registry of live push subscriptions.
///
/// Subscribers are grouped per conversation in a sharded map, so pushes to
/// unrelated conversations do not share a lock. Nothing here is persisted: a
/// restart loses every subscription, and the durable side recovers through
/// reconciliation when clients come back.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    // conversation_id -> subscribers
    inner: Arc<DashMap<Uuid, Vec<Subscriber>>>,
    // token -> conversation_id
    index: Arc<DashMap<SubscriptionToken, Uuid>>,
    ttl: Duration,
}

impl SubscriptionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            index: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Register a live subscription and return its token together with the
    /// channel pushes arrive on.
    pub fn subscribe(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> (SubscriptionToken, UnboundedReceiver<WsOutboundEvent>) {
        let (tx, rx) = unbounded_channel();
        let token = SubscriptionToken::new();

        self.inner
            .entry(conversation_id)
            .or_default()
            .push(Subscriber {
                token,
                recipient_id,
                sender: tx,
                last_seen: now,
                in_flight: BTreeMap::new(),
            });
        self.index.insert(token, conversation_id);
        metrics::set_live_subscriptions(self.index.len());

        tracing::debug!(%token, %recipient_id, %conversation_id, "subscription registered");
        (token, rx)
    }

    /// Refresh liveness. False when the token is unknown or already expired.
    pub fn heartbeat(&self, token: SubscriptionToken, now: DateTime<Utc>) -> bool {
        let conversation_id = match self.index.get(&token) {
            Some(entry) => *entry,
            None => return false,
        };
        let mut subscribers = match self.inner.get_mut(&conversation_id) {
            Some(subscribers) => subscribers,
            None => return false,
        };
        match subscribers.iter_mut().find(|s| s.token == token) {
            Some(sub) if !sub.is_expired(now, self.ttl) => {
                sub.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Drop a subscription. Returns the messages it was pushed but never
    /// acknowledged.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> Vec<Orphan> {
        let conversation_id = match self.index.remove(&token) {
            Some((_, conversation_id)) => conversation_id,
            None => return Vec::new(),
        };

        let removed = {
            let mut subscribers = match self.inner.get_mut(&conversation_id) {
                Some(subscribers) => subscribers,
                None => return Vec::new(),
            };
            subscribers
                .iter()
                .position(|s| s.token == token)
                .map(|pos| subscribers.remove(pos))
        };
        self.inner
            .remove_if(&conversation_id, |_, subscribers| subscribers.is_empty());
        metrics::set_live_subscriptions(self.index.len());

        tracing::debug!(%token, %conversation_id, "subscription removed");
        removed
            .map(|sub| sub.into_orphans(conversation_id).collect())
            .unwrap_or_default()
    }

    /// Drop the recipient's subscriptions on this conversation whose session
    /// is already gone (receiver dropped) but whose TTL has not run out yet.
    pub fn reap_closed(&self, recipient_id: Uuid, conversation_id: Uuid) -> Vec<Orphan> {
        self.remove_where(conversation_id, |s| {
            s.recipient_id == recipient_id && s.sender.is_closed()
        })
    }

    /// Drop every subscription the recipient holds on the conversation. The
    /// channels close, which ends the sessions reading from them.
    pub fn unsubscribe_recipient(&self, recipient_id: Uuid, conversation_id: Uuid) -> Vec<Orphan> {
        self.remove_where(conversation_id, |s| s.recipient_id == recipient_id)
    }

    /// Remove every subscription that missed its heartbeat deadline.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Orphan> {
        let mut expired: Vec<(Uuid, Subscriber)> = Vec::new();

        for mut entry in self.inner.iter_mut() {
            let conversation_id = *entry.key();
            let subscribers = entry.value_mut();
            let mut i = 0;
            while i < subscribers.len() {
                if subscribers[i].is_expired(now, self.ttl) {
                    expired.push((conversation_id, subscribers.remove(i)));
                } else {
                    i += 1;
                }
            }
        }
        if expired.is_empty() {
            return Vec::new();
        }

        self.inner.retain(|_, subscribers| !subscribers.is_empty());
        for (_, sub) in &expired {
            self.index.remove(&sub.token);
        }
        metrics::record_subscriptions_expired(expired.len());
        metrics::set_live_subscriptions(self.index.len());
        tracing::info!(count = expired.len(), "expired stale subscriptions");

        expired
            .into_iter()
            .flat_map(|(conversation_id, sub)| sub.into_orphans(conversation_id))
            .collect()
    }

    /// Push one message event to every live subscription of `recipient_id`
    /// in the conversation. Subscriptions whose channel is closed or whose
    /// heartbeat lapsed are removed on the way.
    pub fn push(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        event: &WsOutboundEvent,
        message_id: Uuid,
        seq: i64,
        now: DateTime<Utc>,
    ) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let mut removed = Vec::new();
        {
            let mut subscribers = match self.inner.get_mut(&conversation_id) {
                Some(subscribers) => subscribers,
                None => return outcome,
            };

            let mut i = 0;
            while i < subscribers.len() {
                let sub = &mut subscribers[i];
                if sub.recipient_id != recipient_id {
                    i += 1;
                    continue;
                }
                if sub.is_expired(now, self.ttl) {
                    removed.push(subscribers.remove(i));
                    continue;
                }
                if sub.sender.send(event.clone()).is_err() {
                    metrics::record_push(false);
                    removed.push(subscribers.remove(i));
                    continue;
                }

                metrics::record_push(true);
                outcome.delivered += 1;
                if let Some((evicted_seq, evicted_id)) = sub.track(seq, message_id) {
                    outcome.orphans.push(Orphan {
                        recipient_id,
                        conversation_id,
                        message_id: evicted_id,
                        seq: evicted_seq,
                    });
                }
                i += 1;
            }
        }

        self.forget(conversation_id, &removed);
        outcome.orphans.extend(
            removed
                .into_iter()
                .flat_map(|sub| sub.into_orphans(conversation_id)),
        );
        outcome
    }

    /// Send an event to every live subscription of a conversation, except
    /// those of `skip`. Nothing is tracked for acknowledgment.
    pub fn broadcast(
        &self,
        conversation_id: Uuid,
        event: &WsOutboundEvent,
        skip: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let mut removed = Vec::new();
        {
            let mut subscribers = match self.inner.get_mut(&conversation_id) {
                Some(subscribers) => subscribers,
                None => return outcome,
            };

            let mut i = 0;
            while i < subscribers.len() {
                let sub = &subscribers[i];
                if Some(sub.recipient_id) == skip {
                    i += 1;
                    continue;
                }
                if sub.is_expired(now, self.ttl) || sub.sender.send(event.clone()).is_err() {
                    removed.push(subscribers.remove(i));
                    continue;
                }
                outcome.delivered += 1;
                i += 1;
            }
        }

        self.forget(conversation_id, &removed);
        outcome.orphans.extend(
            removed
                .into_iter()
                .flat_map(|sub| sub.into_orphans(conversation_id)),
        );
        outcome
    }

    /// Send a control event to the recipient's subscriptions on this
    /// conversation. Closed channels are left for the next push to clean up.
    pub fn push_control(
        &self,
        recipient_id: Uuid,
        conversation_id: Uuid,
        event: &WsOutboundEvent,
        now: DateTime<Utc>,
    ) -> usize {
        self.inner
            .get(&conversation_id)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|s| s.recipient_id == recipient_id && !s.is_expired(now, self.ttl))
                    .filter(|s| s.sender.send(event.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Clear acknowledged messages from every subscription the recipient has
    /// on this conversation.
    pub fn acknowledge(&self, recipient_id: Uuid, conversation_id: Uuid, message_ids: &[Uuid]) -> usize {
        let acked: HashSet<Uuid> = message_ids.iter().copied().collect();
        let mut cleared = 0;
        if let Some(mut subscribers) = self.inner.get_mut(&conversation_id) {
            for sub in subscribers.iter_mut().filter(|s| s.recipient_id == recipient_id) {
                let before = sub.in_flight.len();
                sub.in_flight.retain(|_, id| !acked.contains(id));
                cleared += before - sub.in_flight.len();
            }
        }
        cleared
    }

    /// Clear everything up to `seq` once the recipient has read it.
    pub fn acknowledge_through(&self, recipient_id: Uuid, conversation_id: Uuid, seq: i64) -> usize {
        let mut cleared = 0;
        if let Some(mut subscribers) = self.inner.get_mut(&conversation_id) {
            for sub in subscribers.iter_mut().filter(|s| s.recipient_id == recipient_id) {
                let before = sub.in_flight.len();
                sub.in_flight.retain(|pushed_seq, _| *pushed_seq > seq);
                cleared += before - sub.in_flight.len();
            }
        }
        cleared
    }

    /// Message ids pushed to the recipient's open sessions and not yet
    /// acknowledged.
    pub fn in_flight(&self, recipient_id: Uuid, conversation_id: Uuid) -> HashSet<Uuid> {
        self.inner
            .get(&conversation_id)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|s| s.recipient_id == recipient_id && !s.sender.is_closed())
                    .flat_map(|s| s.in_flight.values().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, token: SubscriptionToken) -> bool {
        self.index.contains_key(&token)
    }

    /// Total registered subscriptions
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn remove_where(
        &self,
        conversation_id: Uuid,
        doomed: impl Fn(&Subscriber) -> bool,
    ) -> Vec<Orphan> {
        let removed: Vec<Subscriber> = {
            let mut subscribers = match self.inner.get_mut(&conversation_id) {
                Some(subscribers) => subscribers,
                None => return Vec::new(),
            };
            let (removed, kept): (Vec<Subscriber>, Vec<Subscriber>) =
                std::mem::take(&mut *subscribers)
                    .into_iter()
                    .partition(|s| doomed(s));
            *subscribers = kept;
            removed
        };

        self.forget(conversation_id, &removed);
        removed
            .into_iter()
            .flat_map(|sub| sub.into_orphans(conversation_id))
            .collect()
    }

    fn forget(&self, conversation_id: Uuid, removed: &[Subscriber]) {
        if removed.is_empty() {
            return;
        }
        for sub in removed {
            self.index.remove(&sub.token);
        }
        self.inner
            .remove_if(&conversation_id, |_, subscribers| subscribers.is_empty());
        metrics::set_live_subscriptions(self.index.len());
        tracing::debug!(
            %conversation_id,
            dropped = removed.len(),
            "dropped dead subscriptions"
        );
    }
}
