pub mod conversation_service;
pub mod delivery_ledger;
pub mod dispatcher;
pub mod memory;
pub mod message_store;
pub mod messaging;
pub mod postgres;

use crate::config::Config;
use crate::services::conversation_service::ConversationStore;
use crate::services::delivery_ledger::DeliveryLedger;
use crate::services::dispatcher::FanoutSettings;
use crate::services::memory::InMemoryStore;
use crate::services::message_store::MessageStore;
use crate::services::postgres::PgStore;
use chrono::Duration;
use deadpool_postgres::Pool;
use std::sync::Arc;

pub use messaging::{
    DeliveryStatus, HistoryQuery, MessagingCore, SendReceipt, SendRequest, Subscription,
};

/// The three storage seams the core runs on.
#[derive(Clone)]
pub struct Backends {
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
    pub ledger: Arc<dyn DeliveryLedger>,
}

impl Backends {
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            conversations: store.clone(),
            messages: store.clone(),
            ledger: store,
        }
    }

    pub fn postgres(pool: Pool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            conversations: store.clone(),
            messages: store.clone(),
            ledger: store,
        }
    }
}

/// Tunables of the core, derived from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct CoreSettings {
    pub edit_window: Duration,
    pub subscription_ttl: Duration,
    pub history_max_limit: usize,
    pub fanout: FanoutSettings,
}

impl From<&Config> for CoreSettings {
    fn from(config: &Config) -> Self {
        Self {
            edit_window: Duration::seconds(config.edit_window_secs),
            subscription_ttl: Duration::seconds(config.subscription_ttl_secs),
            history_max_limit: config.history_max_limit,
            fanout: FanoutSettings {
                batch_size: config.fanout_batch_size,
                inline_limit: config.fanout_inline_limit,
                workers: config.fanout_workers,
            },
        }
    }
}
