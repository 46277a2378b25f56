mod common;

use chat_delivery_service::error::AppError;
use chat_delivery_service::models::{DeliveryState, NewMessage, SendTarget};
use chat_delivery_service::services::message_store::MessageStore;
use chat_delivery_service::services::{DeliveryStatus, HistoryQuery, SendRequest};
use chat_delivery_service::websocket::message_types::WsOutboundEvent;
use chrono::Duration;
use common::{core, core_with, drain, pushed_seqs, settings, user};
use futures::TryStreamExt;
use std::collections::HashSet;

#[tokio::test]
async fn test_private_history_is_ordered_by_seq() {
    let t = core();
    let (alice, bob) = (user(), user());

    let first = t
        .core
        .send(alice, SendRequest::text(SendTarget::User(bob), "hi"))
        .await
        .unwrap();
    let second = t
        .core
        .send(bob, SendRequest::text(SendTarget::User(alice), "hello"))
        .await
        .unwrap();
    assert_eq!(first.conversation_id, second.conversation_id);

    let history = t
        .core
        .history(alice, first.conversation_id, HistoryQuery::default())
        .await
        .unwrap();
    let seen: Vec<_> = history
        .iter()
        .map(|m| (m.sender_id, m.body.as_str(), m.seq))
        .collect();
    assert_eq!(seen, vec![(alice, "hi", 1), (bob, "hello", 2)]);
}

#[tokio::test]
async fn test_group_notification_cleared_by_read_ack() {
    let t = core();
    let (admin, alice) = (user(), user());

    let group = t.core.create_group("3D Chat", admin).await.unwrap();
    t.core.add_member(group.id, admin, alice).await.unwrap();

    let receipt = t
        .core
        .send(
            admin,
            SendRequest::text(SendTarget::Group("3D Chat".into()), "welcome"),
        )
        .await
        .unwrap();
    assert_eq!(receipt.delivery, DeliveryStatus::Delivered);

    let subscription = t.core.subscribe(alice, group.id).await.unwrap();
    assert_eq!(subscription.backlog.len(), 1);
    assert_eq!(subscription.backlog[0].message_id, receipt.message_id);
    assert_eq!(subscription.backlog[0].preview, "welcome");

    let outcome = t.core.ack_read(alice, group.id, receipt.seq).await.unwrap();
    assert_eq!(outcome.cleared, 1);
    assert!(t.core.pending_notifications(alice).await.unwrap().is_empty());

    // The sender never gets a notification for their own message.
    assert!(t.core.pending_notifications(admin).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_get_distinct_gap_free_seqs() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let core = t.core.clone();
        let sender = if i % 2 == 0 { alice } else { bob };
        handles.push(tokio::spawn(async move {
            core.send(
                sender,
                SendRequest::text(SendTarget::Conversation(conversation.id), format!("m{i}")),
            )
            .await
            .unwrap()
            .seq
        }));
    }

    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.await.unwrap());
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=32).collect::<Vec<i64>>());

    let history = t
        .core
        .history(alice, conversation.id, HistoryQuery::after(0, 100))
        .await
        .unwrap();
    let history_seqs: Vec<i64> = history.iter().map(|m| m.seq).collect();
    assert_eq!(history_seqs, (1..=32).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_push_then_disconnect_leaves_exactly_one_notification() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();

    let mut subscription = t.core.subscribe(bob, conversation.id).await.unwrap();
    let receipt = t
        .core
        .send(alice, SendRequest::text(SendTarget::User(bob), "are you there?"))
        .await
        .unwrap();
    assert_eq!(pushed_seqs(&drain(&mut subscription.receiver)), vec![1]);
    assert!(t.core.pending_notifications(bob).await.unwrap().is_empty());

    // Gone before acknowledging.
    assert_eq!(t.core.unsubscribe(subscription.token).await.unwrap(), 1);
    let pending = t.core.pending_notifications(bob).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, receipt.message_id);

    // Reconnecting surfaces it once, without creating another.
    let again = t.core.subscribe(bob, conversation.id).await.unwrap();
    assert_eq!(again.backlog.len(), 1);
    assert_eq!(t.core.pending_notifications(bob).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reconnect_after_dropped_session_surfaces_unacked_push() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();

    let mut first = t.core.subscribe(bob, conversation.id).await.unwrap();
    let receipt = t
        .core
        .send(alice, SendRequest::text(SendTarget::User(bob), "are you there?"))
        .await
        .unwrap();
    assert_eq!(pushed_seqs(&drain(&mut first.receiver)), vec![1]);

    // Connection lost without a close: the old subscription is still registered.
    drop(first.receiver);
    assert!(t.core.registry().contains(first.token));

    let second = t.core.subscribe(bob, conversation.id).await.unwrap();
    assert_eq!(second.backlog.len(), 1);
    assert_eq!(second.backlog[0].message_id, receipt.message_id);
    assert!(!t.core.registry().contains(first.token));
    assert_eq!(t.core.pending_notifications(bob).await.unwrap().len(), 1);

    // Nothing left for the sweeper to turn into a second notification.
    t.clock.advance(Duration::seconds(46));
    assert_eq!(t.core.sweep_expired().await.unwrap(), 0);
    assert_eq!(t.core.pending_notifications(bob).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_acknowledged_push_creates_no_notification_on_disconnect() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();

    let mut subscription = t.core.subscribe(bob, conversation.id).await.unwrap();
    let receipt = t
        .core
        .send(alice, SendRequest::text(SendTarget::User(bob), "ping"))
        .await
        .unwrap();
    drain(&mut subscription.receiver);
    assert_eq!(
        t.core.delivery_state(bob, receipt.message_id).await.unwrap(),
        Some(DeliveryState::Pending)
    );

    let updated = t
        .core
        .ack_delivered(bob, conversation.id, &[receipt.message_id])
        .await
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(
        t.core.delivery_state(bob, receipt.message_id).await.unwrap(),
        Some(DeliveryState::Delivered)
    );
    assert_eq!(t.core.unsubscribe(subscription.token).await.unwrap(), 0);
    assert!(t.core.pending_notifications(bob).await.unwrap().is_empty());

    t.core.ack_read(bob, conversation.id, receipt.seq).await.unwrap();
    assert_eq!(
        t.core.delivery_state(bob, receipt.message_id).await.unwrap(),
        Some(DeliveryState::Read)
    );
    assert_eq!(t.core.delivery_state(alice, receipt.message_id).await.unwrap(), None);
}

#[tokio::test]
async fn test_expired_subscription_falls_back_to_notification() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();

    let mut subscription = t.core.subscribe(bob, conversation.id).await.unwrap();
    t.core
        .send(alice, SendRequest::text(SendTarget::User(bob), "still there?"))
        .await
        .unwrap();
    assert_eq!(pushed_seqs(&drain(&mut subscription.receiver)), vec![1]);

    // Within the TTL a heartbeat keeps the subscription alive.
    t.clock.advance(Duration::seconds(30));
    assert!(t.core.heartbeat(subscription.token));
    assert_eq!(t.core.sweep_expired().await.unwrap(), 0);

    t.clock.advance(Duration::seconds(46));
    assert!(!t.core.heartbeat(subscription.token));
    assert_eq!(t.core.sweep_expired().await.unwrap(), 1);
    assert!(!t.core.registry().contains(subscription.token));
    assert_eq!(t.core.pending_notifications(bob).await.unwrap().len(), 1);

    // Messages sent after expiry go straight to notifications.
    t.core
        .send(alice, SendRequest::text(SendTarget::User(bob), "guess not"))
        .await
        .unwrap();
    assert!(drain(&mut subscription.receiver).is_empty());
    assert_eq!(t.core.pending_notifications(bob).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_edit_after_window_is_rejected_and_content_unchanged() {
    let t = core();
    let (alice, bob) = (user(), user());
    let receipt = t
        .core
        .send(alice, SendRequest::text(SendTarget::User(bob), "draft"))
        .await
        .unwrap();

    t.clock.advance(Duration::seconds(60));
    let mut subscription = t.core.subscribe(bob, receipt.conversation_id).await.unwrap();
    let edited = t
        .core
        .edit(alice, receipt.message_id, "final".into())
        .await
        .unwrap();
    assert_eq!(edited.body, "final");
    assert!(edited.edited_at.is_some());
    assert!(drain(&mut subscription.receiver).iter().any(|e| matches!(
        e,
        WsOutboundEvent::MessageEdited { message } if message.body == "final"
    )));

    let err = t
        .core
        .edit(bob, receipt.message_id, "hijack".into())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    t.clock.advance(Duration::seconds(300));
    let err = t
        .core
        .edit(alice, receipt.message_id, "too late".into())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::EditWindowExpired { max_edit_secs: 300 }));

    let history = t
        .core
        .history(bob, receipt.conversation_id, HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(history[0].body, "final");
}

#[tokio::test]
async fn test_delete_tombstones_and_keeps_numbering() {
    let t = core();
    let (alice, bob) = (user(), user());
    let first = t
        .core
        .send(alice, SendRequest::text(SendTarget::User(bob), "oops"))
        .await
        .unwrap();
    t.core
        .send(alice, SendRequest::text(SendTarget::User(bob), "never mind"))
        .await
        .unwrap();

    let mut subscription = t.core.subscribe(bob, first.conversation_id).await.unwrap();

    assert!(matches!(
        t.core.delete(bob, first.message_id).await,
        Err(AppError::PermissionDenied(_))
    ));
    let deleted = t.core.delete(alice, first.message_id).await.unwrap();
    assert!(deleted.is_deleted());
    assert!(deleted.body.is_empty());

    // Repeated deletes succeed and broadcast nothing new.
    t.core.delete(alice, first.message_id).await.unwrap();
    let events = drain(&mut subscription.receiver);
    let deletions = events
        .iter()
        .filter(|e| matches!(e, WsOutboundEvent::MessageDeleted { seq: 1, .. }))
        .count();
    assert_eq!(deletions, 1);

    let history = t
        .core
        .history(alice, first.conversation_id, HistoryQuery::default())
        .await
        .unwrap();
    let seqs: Vec<i64> = history.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
    assert!(history[0].is_deleted());

    assert!(matches!(
        t.core.edit(alice, first.message_id, "back".into()).await,
        Err(AppError::AlreadyDeleted)
    ));
}

#[tokio::test]
async fn test_idempotent_send_returns_original() {
    let t = core();
    let (alice, bob) = (user(), user());
    let mut request = SendRequest::text(SendTarget::User(bob), "once");
    request.idempotency_key = Some("client-42".into());

    let first = t.core.send(alice, request.clone()).await.unwrap();
    let retry = t.core.send(alice, request).await.unwrap();
    assert!(!first.duplicate);
    assert!(retry.duplicate);
    assert_eq!(retry.delivery, DeliveryStatus::Skipped);
    assert_eq!(first.message_id, retry.message_id);
    assert_eq!(first.seq, retry.seq);

    let history = t
        .core
        .history(bob, first.conversation_id, HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(t.core.pending_notifications(bob).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reconnect_reconciles_messages_missed_by_a_crash() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();

    // Appended, but the process died before fan-out.
    let now = chrono::Utc::now();
    for body in ["lost one", "lost two"] {
        t.backends
            .messages
            .append(
                NewMessage {
                    conversation_id: conversation.id,
                    sender_id: alice,
                    body: body.into(),
                    attachment_ref: None,
                    idempotency_key: None,
                },
                now,
            )
            .await
            .unwrap();
    }
    assert!(t.core.pending_notifications(bob).await.unwrap().is_empty());

    let subscription = t.core.subscribe(bob, conversation.id).await.unwrap();
    assert_eq!(subscription.latest_seq, 2);
    assert_eq!(subscription.last_read_seq, 0);
    let previews: Vec<_> = subscription
        .backlog
        .iter()
        .map(|n| n.preview.as_str())
        .collect();
    assert_eq!(previews, vec!["lost one", "lost two"]);

    // A second pass finds nothing left to repair.
    assert_eq!(t.core.reconcile(bob, conversation.id).await.unwrap(), 0);
    // The author has nothing to be told about.
    assert_eq!(t.core.reconcile(alice, conversation.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_large_group_fans_out_in_background() {
    let mut settings = settings();
    settings.fanout.inline_limit = 2;
    settings.fanout.batch_size = 3;
    let t = core_with(settings);

    let owner = user();
    let group = t.core.create_group("big room", owner).await.unwrap();
    let members: Vec<_> = (0..10).map(|_| user()).collect();
    for member in &members {
        t.core.add_member(group.id, owner, *member).await.unwrap();
    }

    let mut live = t.core.subscribe(members[0], group.id).await.unwrap();

    let mut receipts = Vec::new();
    for i in 0..3 {
        let receipt = t
            .core
            .send(
                owner,
                SendRequest::text(SendTarget::Conversation(group.id), format!("update {i}")),
            )
            .await
            .unwrap();
        assert_eq!(receipt.delivery, DeliveryStatus::Queued);
        receipts.push(receipt);
    }
    t.core.dispatcher().wait_idle(group.id).await;
    assert_eq!(t.core.dispatcher().active_lanes(), 0);

    assert_eq!(pushed_seqs(&drain(&mut live.receiver)), vec![1, 2, 3]);
    assert!(t.core.pending_notifications(members[0]).await.unwrap().is_empty());
    for member in &members[1..] {
        let pending = t.core.pending_notifications(*member).await.unwrap();
        let ids: HashSet<_> = pending.iter().map(|n| n.message_id).collect();
        assert_eq!(pending.len(), 3);
        assert!(receipts.iter().all(|r| ids.contains(&r.message_id)));
    }
}

#[tokio::test]
async fn test_lanes_are_released_once_idle() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();
    t.core
        .send(alice, SendRequest::text(SendTarget::User(bob), "hi"))
        .await
        .unwrap();
    assert_eq!(t.core.dispatcher().active_lanes(), 0);

    // A send cancelled while waiting for the lane does not pin it.
    let held = t.core.dispatcher().enter(conversation.id).await;
    let dispatcher = t.core.dispatcher().clone();
    let conversation_id = conversation.id;
    let waiting = tokio::spawn(async move {
        let _guard = dispatcher.enter(conversation_id).await;
    });
    tokio::task::yield_now().await;
    waiting.abort();
    assert!(waiting.await.unwrap_err().is_cancelled());
    assert_eq!(t.core.dispatcher().active_lanes(), 1);

    drop(held);
    assert_eq!(t.core.dispatcher().active_lanes(), 0);
    t.core.dispatcher().wait_idle(conversation.id).await;
}

#[tokio::test]
async fn test_every_device_receives_the_push() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();

    let mut phone = t.core.subscribe(bob, conversation.id).await.unwrap();
    let mut laptop = t.core.subscribe(bob, conversation.id).await.unwrap();
    assert_ne!(phone.token, laptop.token);

    for body in ["one", "two", "three"] {
        t.core
            .send(alice, SendRequest::text(SendTarget::User(bob), body))
            .await
            .unwrap();
    }

    assert_eq!(pushed_seqs(&drain(&mut phone.receiver)), vec![1, 2, 3]);
    assert_eq!(pushed_seqs(&drain(&mut laptop.receiver)), vec![1, 2, 3]);
    assert!(t.core.pending_notifications(bob).await.unwrap().is_empty());

    // Closing one device leaves the other acknowledged by read.
    t.core.ack_read(bob, conversation.id, 3).await.unwrap();
    assert_eq!(t.core.unsubscribe(phone.token).await.unwrap(), 0);
    assert_eq!(t.core.unsubscribe(laptop.token).await.unwrap(), 0);
}

#[tokio::test]
async fn test_history_stream_and_offset_paging() {
    let t = core();
    let (alice, bob) = (user(), user());
    let conversation = t.core.open_private(alice, bob).await.unwrap();
    for i in 1..=7 {
        t.core
            .send(
                alice,
                SendRequest::text(SendTarget::Conversation(conversation.id), format!("#{i}")),
            )
            .await
            .unwrap();
    }

    let page = t
        .core
        .history(
            bob,
            conversation.id,
            HistoryQuery {
                after_seq: None,
                skip: Some(5),
                limit: Some(10),
            },
        )
        .await
        .unwrap();
    assert_eq!(page.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![6, 7]);

    let streamed: Vec<_> = t
        .core
        .history_stream(bob, conversation.id, 3)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        streamed.iter().map(|m| m.seq).collect::<Vec<_>>(),
        vec![4, 5, 6, 7]
    );

    let outsider = user();
    assert!(matches!(
        t.core
            .history(outsider, conversation.id, HistoryQuery::default())
            .await,
        Err(AppError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_conversation_list_orders_by_unread() {
    let t = core();
    let (alice, bob, carol) = (user(), user(), user());

    t.core
        .send(bob, SendRequest::text(SendTarget::User(alice), "hey"))
        .await
        .unwrap();
    for body in ["a", "b"] {
        t.core
            .send(carol, SendRequest::text(SendTarget::User(alice), body))
            .await
            .unwrap();
    }

    let summaries = t.core.conversations_for(alice).await.unwrap();
    let unread: Vec<i64> = summaries.iter().map(|s| s.unread).collect();
    assert_eq!(unread, vec![2, 1]);
    assert_eq!(summaries[0].conversation.counterpart(alice), Some(carol));
}
