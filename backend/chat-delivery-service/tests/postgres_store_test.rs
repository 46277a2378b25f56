//! Runs against a real database:
//! `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`

mod common;

use chat_delivery_service::clock::SystemClock;
use chat_delivery_service::db;
use chat_delivery_service::error::AppError;
use chat_delivery_service::models::{HistoryRange, NewMessage, SendTarget};
use chat_delivery_service::services::conversation_service::ConversationStore;
use chat_delivery_service::services::message_store::MessageStore;
use chat_delivery_service::services::postgres::PgStore;
use chat_delivery_service::services::{Backends, MessagingCore, SendRequest};
use chrono::Utc;
use deadpool_postgres::Pool;
use std::sync::Arc;
use uuid::Uuid;

async fn pool() -> Pool {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let pool = db::init_pool(&url, 8).await.expect("connect");
    db::run_migrations(&pool).await.expect("migrate");
    pool
}

fn draft(conversation_id: Uuid, sender_id: Uuid, body: &str) -> NewMessage {
    NewMessage {
        conversation_id,
        sender_id,
        body: body.into(),
        attachment_ref: None,
        idempotency_key: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_pg_concurrent_appends_are_gap_free() {
    let pool = pool().await;
    let core = MessagingCore::new(
        Backends::postgres(pool.clone()),
        Arc::new(SystemClock),
        common::settings(),
    );
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = core.open_private(alice, bob).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let core = core.clone();
        handles.push(tokio::spawn(async move {
            core.send(
                alice,
                SendRequest::text(SendTarget::Conversation(conversation.id), format!("{i}")),
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
    assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
    assert_eq!(core.pending_notifications(bob).await.unwrap().len(), 20);
}

#[tokio::test]
#[ignore]
async fn test_pg_idempotency_and_tombstone() {
    let store = PgStore::new(pool().await);
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let now = Utc::now();
    let conversation = chat_delivery_service::services::conversation_service::ConversationResolver::new(
        Arc::new(store.clone()),
    )
    .open_private(alice, bob, now)
    .await
    .unwrap();

    let mut first = draft(conversation.id, alice, "hello");
    first.idempotency_key = Some("pg-key".into());
    let appended = store.append(first.clone(), now).await.unwrap();
    let replay = store.append(first, now).await.unwrap();
    assert!(replay.is_duplicate());
    assert_eq!(appended.message().id, replay.message().id);

    let id = appended.message().id;
    let deleted = store.tombstone(id, now).await.unwrap();
    assert!(deleted.is_deleted());
    assert!(store.tombstone(id, now).await.unwrap().is_deleted());
    assert!(matches!(
        store.update_body(id, "again".into(), now).await,
        Err(AppError::AlreadyDeleted)
    ));

    let page = store
        .read(conversation.id, HistoryRange::After { after_seq: 0, limit: 10 })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].seq, 1);
}

#[tokio::test]
#[ignore]
async fn test_pg_group_name_conflict_and_last_member() {
    let store = PgStore::new(pool().await);
    let resolver =
        chat_delivery_service::services::conversation_service::ConversationResolver::new(
            Arc::new(store.clone()),
        );
    let creator = Uuid::new_v4();
    let name = format!("pg-group-{}", Uuid::new_v4());

    let group = resolver.create_group(&name, creator, Utc::now()).await.unwrap();
    assert!(matches!(
        resolver.create_group(&name, Uuid::new_v4(), Utc::now()).await,
        Err(AppError::AlreadyExists(_))
    ));
    assert!(matches!(
        store.remove_member(group.id, creator).await,
        Err(AppError::BadRequest(_))
    ));
    assert!(!store.remove_member(group.id, Uuid::new_v4()).await.unwrap());
}
