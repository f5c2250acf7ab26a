use once_cell::sync::OnceCell;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::BoxError;

/// Metric set for the per-connection signaling relay.
pub struct RelayMetrics {
    pub connections_active: IntGauge,
    pub connections_total: IntCounter,
    pub connections_rejected_total: IntCounterVec,
    pub messages_total: IntCounterVec,
    pub signals_relayed_total: IntCounterVec,
}

impl RelayMetrics {
    pub fn on_startup(&self) {
        self.connections_total.inc_by(0);
        self.connections_active.set(0);
    }

    pub fn on_connect(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn on_disconnect(&self) {
        self.connections_active.dec();
    }

    pub fn on_rejected(&self, reason: &str) {
        self.connections_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn on_message(&self, kind: &str) {
        self.messages_total.with_label_values(&[kind]).inc();
    }

    pub fn on_signal(&self, kind: &str) {
        self.signals_relayed_total.with_label_values(&[kind]).inc();
    }
}

/// Metric set for the reclamation jobs.
pub struct ReaperMetrics {
    pub peers_marked_stale_total: IntCounter,
    pub peers_deleted_total: IntCounter,
    pub sessions_deleted_total: IntCounter,
    pub job_failures_total: IntCounter,
}

impl ReaperMetrics {
    pub fn on_startup(&self) {
        self.peers_marked_stale_total.inc_by(0);
        self.peers_deleted_total.inc_by(0);
        self.sessions_deleted_total.inc_by(0);
        self.job_failures_total.inc_by(0);
    }
}

static RELAY_METRICS: OnceCell<RelayMetrics> = OnceCell::new();
static REAPER_METRICS: OnceCell<ReaperMetrics> = OnceCell::new();

pub fn relay_metrics() -> &'static RelayMetrics {
    RELAY_METRICS.get_or_init(|| RelayMetrics {
        connections_active: register_int_gauge!(
            "signaling_connections_active",
            "Signaling websocket connections currently open"
        )
        .expect("register signaling_connections_active"),
        connections_total: register_int_counter!(
            "signaling_connections_total",
            "Signaling websocket connections accepted"
        )
        .expect("register signaling_connections_total"),
        connections_rejected_total: register_int_counter_vec!(
            "signaling_connections_rejected_total",
            "Signaling connections closed during establishment",
            &["reason"]
        )
        .expect("register signaling_connections_rejected_total"),
        messages_total: register_int_counter_vec!(
            "signaling_messages_total",
            "Inbound signaling messages by type",
            &["type"]
        )
        .expect("register signaling_messages_total"),
        signals_relayed_total: register_int_counter_vec!(
            "signaling_signals_relayed_total",
            "Offer/answer/ICE messages forwarded to a target peer",
            &["type"]
        )
        .expect("register signaling_signals_relayed_total"),
    })
}

pub fn reaper_metrics() -> &'static ReaperMetrics {
    REAPER_METRICS.get_or_init(|| ReaperMetrics {
        peers_marked_stale_total: register_int_counter!(
            "reaper_peers_marked_stale_total",
            "Peers flipped to disconnected for missing heartbeats"
        )
        .expect("register reaper_peers_marked_stale_total"),
        peers_deleted_total: register_int_counter!(
            "reaper_peers_deleted_total",
            "Disconnected peers deleted after retention"
        )
        .expect("register reaper_peers_deleted_total"),
        sessions_deleted_total: register_int_counter!(
            "reaper_sessions_deleted_total",
            "Ended sessions deleted after retention"
        )
        .expect("register reaper_sessions_deleted_total"),
        job_failures_total: register_int_counter!(
            "reaper_job_failures_total",
            "Reaper job runs that returned an error"
        )
        .expect("register reaper_job_failures_total"),
    })
}

/// Renders every registered metric in the prometheus text format.
pub fn render() -> Result<(String, String), BoxError> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    let body = String::from_utf8(buffer)?;
    Ok((encoder.format_type().to_string(), body))
}
