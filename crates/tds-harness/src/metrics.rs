use crate::engine::proxy::ACTIVE_CONNECTIONS;
use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::sync::atomic::Ordering;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CONNECTION_GAUGE: Gauge = Gauge::new(
        "tds_harness_active_connections",
        "Number of client connections currently relayed by in-process proxies"
    )
    .expect("metric can be created");
    pub static ref PROXIED_CONNECTIONS: IntCounter = IntCounter::new(
        "tds_harness_proxied_connections_total",
        "Total number of client connections accepted by in-process proxies"
    )
    .expect("metric can be created");
    /// LOGIN7 packets rewritten with injected credentials
    pub static ref CREDENTIAL_INJECTIONS: IntCounter = IntCounter::new(
        "tds_harness_credential_injections_total",
        "Total number of LOGIN7 packets rewritten with injected credentials"
    )
    .expect("metric can be created");
    pub static ref MOCK_CAPTURES: IntCounter = IntCounter::new(
        "tds_harness_mock_captures_total",
        "Total number of handshakes captured by mock targets"
    )
    .expect("metric can be created");
    /// Proxy or mock handshakes that failed before completing LOGIN7
    pub static ref HANDSHAKE_FAILURES: IntCounter = IntCounter::new(
        "tds_harness_handshake_failures_total",
        "Total number of TDS handshakes that failed before LOGIN7 completed"
    )
    .expect("metric can be created");
}

pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(CONNECTION_GAUGE.clone()));
    let _ = REGISTRY.register(Box::new(PROXIED_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(CREDENTIAL_INJECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(MOCK_CAPTURES.clone()));
    let _ = REGISTRY.register(Box::new(HANDSHAKE_FAILURES.clone()));
}

fn update_metrics() {
    let count = ACTIVE_CONNECTIONS.load(Ordering::SeqCst) as f64;
    CONNECTION_GAUGE.set(count);
}

pub fn render_metrics() -> String {
    update_metrics();

    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| "# Error: Invalid UTF8".to_string())
}
