//! Prometheus metrics for the delivery core

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

static MESSAGES_APPENDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_messages_appended_total",
        "Messages durably appended to a conversation log"
    )
    .expect("failed to register chat_messages_appended_total")
});

static PUSH_DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chat_push_deliveries_total",
        "Push attempts to live subscriptions (delivered/failed)",
        &["result"]
    )
    .expect("failed to register chat_push_deliveries_total")
});

static NOTIFICATIONS_CREATED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chat_notifications_created_total",
        "Pending notifications created, by origin",
        &["source"]
    )
    .expect("failed to register chat_notifications_created_total")
});

static LIVE_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "chat_live_subscriptions",
        "Subscriptions currently registered for push"
    )
    .expect("failed to register chat_live_subscriptions")
});

static FANOUT_LANES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "chat_fanout_lanes",
        "Conversations with a send in progress or fan-out queued"
    )
    .expect("failed to register chat_fanout_lanes")
});

static SUBSCRIPTIONS_EXPIRED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_subscriptions_expired_total",
        "Subscriptions removed after missing heartbeats"
    )
    .expect("failed to register chat_subscriptions_expired_total")
});

static FANOUT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "chat_fanout_failures_total",
        "Background fan-out jobs that ended with an error"
    )
    .expect("failed to register chat_fanout_failures_total")
});

static FANOUT_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "chat_fanout_duration_seconds",
        "Time spent fanning one message out to its recipients",
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("failed to register chat_fanout_duration_seconds")
});

pub fn record_message_appended() {
    MESSAGES_APPENDED_TOTAL.inc();
}

pub fn record_push(delivered: bool) {
    let result = if delivered { "delivered" } else { "failed" };
    PUSH_DELIVERIES_TOTAL.with_label_values(&[result]).inc();
}

/// `source` is one of "offline", "orphaned" or "reconciled"
pub fn record_notification_created(source: &str) {
    NOTIFICATIONS_CREATED_TOTAL
        .with_label_values(&[source])
        .inc();
}

pub fn set_live_subscriptions(count: usize) {
    LIVE_SUBSCRIPTIONS.set(count as i64);
}

pub fn set_fanout_lanes(count: usize) {
    FANOUT_LANES.set(count as i64);
}

pub fn record_subscriptions_expired(count: usize) {
    SUBSCRIPTIONS_EXPIRED_TOTAL.inc_by(count as u64);
}

pub fn record_fanout_failure() {
    FANOUT_FAILURES_TOTAL.inc();
}

pub fn observe_fanout_duration(duration: std::time::Duration) {
    FANOUT_DURATION_SECONDS.observe(duration.as_secs_f64());
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
