#![allow(dead_code)]

use chat_delivery_service::clock::ManualClock;
use chat_delivery_service::config::Config;
use chat_delivery_service::services::{Backends, CoreSettings, MessagingCore};
use chat_delivery_service::websocket::message_types::WsOutboundEvent;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub struct TestCore {
    pub core: MessagingCore,
    pub clock: ManualClock,
    pub backends: Backends,
}

pub fn settings() -> CoreSettings {
    CoreSettings::from(&Config::test_defaults())
}

pub fn start_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap())
}

/// Core on the in-memory backend; must be called inside a tokio runtime.
pub fn core_with(settings: CoreSettings) -> TestCore {
    let clock = start_clock();
    let backends = Backends::in_memory();
    let core = MessagingCore::new(backends.clone(), Arc::new(clock.clone()), settings);
    TestCore {
        core,
        clock,
        backends,
    }
}

pub fn core() -> TestCore {
    core_with(settings())
}

pub fn user() -> Uuid {
    Uuid::new_v4()
}

/// Every event already waiting on a subscription channel.
pub fn drain(rx: &mut UnboundedReceiver<WsOutboundEvent>) -> Vec<WsOutboundEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Seq numbers of the message events among `events`.
pub fn pushed_seqs(events: &[WsOutboundEvent]) -> Vec<i64> {
    events
        .iter()
        .filter_map(|e| match e {
            WsOutboundEvent::Message { message } => Some(message.seq),
            _ => None,
        })
        .collect()
}
