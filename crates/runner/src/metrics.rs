use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static JOBS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static JOB_DURATION_SECONDS: OnceLock<Histogram> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static RESULTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

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

fn jobs_total() -> &'static IntCounterVec {
    JOBS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("fedra_runner_jobs_total", "Jobs finished, by outcome."),
                &["outcome"],
            )
            .expect("create fedra_runner_jobs_total"),
        )
    })
}

fn job_duration_seconds() -> &'static Histogram {
    JOB_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            Histogram::with_opts(
                HistogramOpts::new(
                    "fedra_runner_job_duration_seconds",
                    "Wall-clock duration of finished jobs.",
                )
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 600.0]),
            )
            .expect("create fedra_runner_job_duration_seconds"),
        )
    })
}

fn queue_depth() -> &'static IntGauge {
    QUEUE_DEPTH.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "fedra_runner_queue_depth",
                "Approved jobs waiting for an executor slot.",
            )
            .expect("create fedra_runner_queue_depth"),
        )
    })
}

fn results_total() -> &'static IntCounterVec {
    RESULTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "fedra_runner_results_total",
                    "Result rows written, by privacy-gate disposition.",
                ),
                &["disposition"],
            )
            .expect("create fedra_runner_results_total"),
        )
    })
}

pub fn observe_job(outcome: &str, duration: Duration) {
    jobs_total().with_label_values(&[outcome]).inc();
    job_duration_seconds().observe(duration.as_secs_f64());
}

pub fn set_queue_depth(depth: i64) {
    queue_depth().set(depth);
}

pub fn observe_result(released: bool) {
    let disposition = if released { "released" } else { "blocked" };
    results_total().with_label_values(&[disposition]).inc();
}

pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let _ = jobs_total();
    let _ = queue_depth();
    let _ = results_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}
