//! Metrics collection and export for the gateway.
//!
//! The manager keeps its own counters; a sampler task copies them into
//! the `metrics` registry, which is exported in Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tenvis_gateway_core::{CommunicationManager, ManagerStats};
use tokio::task::JoinHandle;
use tracing::info;

/// Metric names.
pub mod names {
    pub const PLUGINS: &str = "gateway_plugins";
    pub const PENDING_REPLIES: &str = "gateway_pending_replies";
    pub const SUBSCRIPTIONS: &str = "gateway_subscriptions";
    pub const SUBSCRIBED_URIS: &str = "gateway_subscribed_uris";
    pub const FORWARDED_TOTAL: &str = "gateway_forwarded_total";
    pub const DROPPED_TOTAL: &str = "gateway_dropped_total";
    pub const FAULTS_TOTAL: &str = "gateway_faults_total";
    pub const UNMATCHED_TOTAL: &str = "gateway_unmatched_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_gauge!(names::PLUGINS, "Number of registered plugins");
    metrics::describe_gauge!(
        names::PENDING_REPLIES,
        "Requests waiting for a reply"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS,
        "Current subscribers, by kind"
    );
    metrics::describe_gauge!(
        names::SUBSCRIBED_URIS,
        "Resources with at least one subscriber"
    );
    metrics::describe_counter!(
        names::FORWARDED_TOTAL,
        "Envelopes delivered to a pipeline stage"
    );
    metrics::describe_counter!(names::DROPPED_TOTAL, "Envelopes dropped by the dispatcher");
    metrics::describe_counter!(names::FAULTS_TOTAL, "Pipeline stage failures");
    metrics::describe_counter!(
        names::UNMATCHED_TOTAL,
        "Replies with no waiting request"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Copy a stats snapshot into the registry.
pub fn record_stats(stats: &ManagerStats) {
    gauge!(names::PLUGINS).set(stats.plugins as f64);
    gauge!(names::PENDING_REPLIES).set(stats.pending_replies as f64);
    gauge!(names::SUBSCRIPTIONS, "kind" => "standing").set(stats.subscriptions.standing as f64);
    gauge!(names::SUBSCRIPTIONS, "kind" => "one_shot").set(stats.subscriptions.one_shot as f64);
    gauge!(names::SUBSCRIBED_URIS).set(stats.subscriptions.uri_count as f64);
    counter!(names::FORWARDED_TOTAL).absolute(stats.forwarded);
    counter!(names::DROPPED_TOTAL).absolute(stats.dropped);
    counter!(names::FAULTS_TOTAL).absolute(stats.faults);
    counter!(names::UNMATCHED_TOTAL).absolute(stats.unmatched);
}

/// Sample manager stats every `interval` until the manager stops.
pub fn spawn_sampler(manager: CommunicationManager, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            record_stats(&manager.stats());
            if !manager.is_running() {
                break;
            }
        }
    })
}
