use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CLASSIFIER_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CLASSIFIER_DURATION_SECONDS: OnceLock<Histogram> = OnceLock::new();
static ESCALATIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

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
                Opts::new(
                    "edgeguard_http_requests_total",
                    "Edge HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create edgeguard_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "edgeguard_http_request_duration_seconds",
                    "Edge HTTP request duration in seconds, excluding downstream time.",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["route", "method", "outcome"],
            )
            .expect("create edgeguard_http_request_duration_seconds"),
        )
    })
}

fn actions_total() -> &'static IntCounterVec {
    ACTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "edgeguard_actions_total",
                    "Final pipeline actions by deciding rule.",
                ),
                &["action", "rule"],
            )
            .expect("create edgeguard_actions_total"),
        )
    })
}

fn classifier_calls_total() -> &'static IntCounterVec {
    CLASSIFIER_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "edgeguard_classifier_calls_total",
                    "Classifier calls by outcome.",
                ),
                &["outcome"],
            )
            .expect("create edgeguard_classifier_calls_total"),
        )
    })
}

fn classifier_duration_seconds() -> &'static Histogram {
    CLASSIFIER_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            Histogram::with_opts(
                HistogramOpts::new(
                    "edgeguard_classifier_duration_seconds",
                    "Classifier call duration in seconds.",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
            )
            .expect("create edgeguard_classifier_duration_seconds"),
        )
    })
}

fn escalations_total() -> &'static IntCounter {
    ESCALATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "edgeguard_escalations_total",
                "Rate-limit keys escalated to the penalty count.",
            )
            .expect("create edgeguard_escalations_total"),
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

pub fn observe_action(action: &str, rule: &str) {
    actions_total().with_label_values(&[action, rule]).inc();
}

pub fn observe_classifier_call(outcome: &str, duration: Duration) {
    classifier_calls_total().with_label_values(&[outcome]).inc();
    classifier_duration_seconds().observe(duration.as_secs_f64());
}

pub fn inc_escalation() {
    escalations_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = escalations_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
