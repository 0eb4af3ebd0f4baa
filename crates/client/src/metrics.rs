//! Prometheus metrics for the stream client
//!
//! Every series carries an `endpoint` label so public, private and business
//! connections in one process stay distinguishable.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

const LABEL_ENDPOINT: &str = "endpoint";
const LABEL_KIND: &str = "kind";
const LABEL_PIPELINE: &str = "pipeline";
const LABEL_CHANNEL: &str = "channel";
const LABEL_REASON: &str = "reason";
const LABEL_TOPIC: &str = "topic";

/// Inbound frames by classified kind
static FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pushfeed_frames_total",
        "Total inbound frames by classified kind",
        &[LABEL_ENDPOINT, LABEL_KIND]
    )
    .expect("Failed to register frames_total metric")
});

/// Connection status (1 = streaming, 0 = not connected)
static CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pushfeed_connected",
        "WebSocket connection status (1=connected, 0=disconnected)",
        &[LABEL_ENDPOINT]
    )
    .expect("Failed to register connected metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pushfeed_reconnects_total",
        "Total reconnection attempts after a lost or failed session",
        &[LABEL_ENDPOINT]
    )
    .expect("Failed to register reconnects_total metric")
});

static DISPATCH_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pushfeed_dispatch_dropped_total",
        "Tasks discarded by a full dispatch queue under the drop policy",
        &[LABEL_ENDPOINT, LABEL_PIPELINE]
    )
    .expect("Failed to register dispatch_dropped_total metric")
});

static BOOK_RESETS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pushfeed_book_resets_total",
        "Order books discarded after a verification failure",
        &[LABEL_ENDPOINT, LABEL_CHANNEL, LABEL_REASON]
    )
    .expect("Failed to register book_resets_total metric")
});

static CALLBACK_PANICS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pushfeed_callback_panics_total",
        "User callbacks that panicked and were contained",
        &[LABEL_ENDPOINT, LABEL_TOPIC]
    )
    .expect("Failed to register callback_panics_total metric")
});

/// Handle for recording metrics for one client endpoint
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    endpoint: String,
}

impl ClientMetrics {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn inc_frame(&self, kind: &str) {
        FRAMES_TOTAL
            .with_label_values(&[&self.endpoint, kind])
            .inc();
    }

    pub fn set_connected(&self) {
        CONNECTED.with_label_values(&[&self.endpoint]).set(1);
    }

    pub fn set_disconnected(&self) {
        CONNECTED.with_label_values(&[&self.endpoint]).set(0);
    }

    pub fn is_connected(&self) -> bool {
        CONNECTED.with_label_values(&[&self.endpoint]).get() == 1
    }

    pub fn inc_reconnect(&self) {
        RECONNECTS_TOTAL.with_label_values(&[&self.endpoint]).inc();
    }

    pub fn inc_dropped(&self, pipeline: &str) {
        DISPATCH_DROPPED_TOTAL
            .with_label_values(&[&self.endpoint, pipeline])
            .inc();
    }

    pub fn inc_book_reset(&self, channel: &str, reason: &str) {
        BOOK_RESETS_TOTAL
            .with_label_values(&[&self.endpoint, channel, reason])
            .inc();
    }

    pub fn inc_callback_panic(&self, topic: &str) {
        CALLBACK_PANICS_TOTAL
            .with_label_values(&[&self.endpoint, topic])
            .inc();
    }
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
