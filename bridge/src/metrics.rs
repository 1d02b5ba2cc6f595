use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref EVENTS_STORED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("bridge_events_stored_total", "Events appended to the store"),
        &["class"]
    )
    .unwrap();
    pub static ref REJECTED_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "bridge_rejected_messages_total",
            "Messages dropped before reaching the store"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref STORAGE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_storage_failures_total",
        "Total failed store reads and writes"
    ))
    .unwrap();
    pub static ref RESPONSES_PUBLISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "bridge_responses_published_total",
            "History responses published"
        ),
        &["class"]
    )
    .unwrap();
    pub static ref RECONNECT_ATTEMPTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "bridge_reconnect_attempts_total",
        "Total scheduled broker reconnection attempts"
    ))
    .unwrap();
    pub static ref CONNECTED: Gauge = Gauge::with_opts(Opts::new(
        "bridge_connected",
        "1 while the broker session is up, 0 otherwise"
    ))
    .unwrap();
    pub static ref STORE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "bridge_store_latency_seconds",
            "Time taken by a single store read or write"
        )
        .buckets(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVENTS_STORED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORAGE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESPONSES_PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONNECT_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONNECTED.clone()))?;
    REGISTRY.register(Box::new(STORE_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
