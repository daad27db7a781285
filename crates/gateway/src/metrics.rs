use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static UPLOADS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REQUESTS_CREATED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("fedra_node_http_requests_total", "Node HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create fedra_node_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "fedra_node_http_request_duration_seconds",
                    "Node HTTP request duration in seconds.",
                )
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
                &["route", "method", "outcome"],
            )
            .expect("create fedra_node_http_request_duration_seconds"),
        )
    })
}

fn uploads_total() -> &'static IntCounterVec {
    UPLOADS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("fedra_node_uploads_total", "Stored uploads, by kind."),
                &["kind"],
            )
            .expect("create fedra_node_uploads_total"),
        )
    })
}

fn requests_created_total() -> &'static IntCounter {
    REQUESTS_CREATED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "fedra_node_requests_created_total",
                "Analysis requests accepted.",
            )
            .expect("create fedra_node_requests_created_total"),
        )
    })
}

fn decisions_total() -> &'static IntCounterVec {
    DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("fedra_node_decisions_total", "Operator decisions, by kind."),
                &["decision"],
            )
            .expect("create fedra_node_decisions_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_upload(kind: &str) {
    uploads_total().with_label_values(&[kind]).inc();
}

pub fn inc_request_created() {
    requests_created_total().inc();
}

pub fn observe_decision(decision: &str) {
    decisions_total().with_label_values(&[decision]).inc();
}

/// Node metrics plus the runner's registry, concatenated into one text
/// exposition.
pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = uploads_total();
    let _ = requests_created_total();
    let _ = decisions_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    buffer.extend_from_slice(&fedra_runner::metrics::render()?);

    Ok((buffer, encoder.format_type().to_string()))
}
