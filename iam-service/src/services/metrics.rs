use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Process-wide collectors and the registry they belong to.
pub struct Metrics {
    pub registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub auth_outcomes_total: IntCounterVec,
    pub rule_evaluations_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "path", "status"],
        )?;

        let auth_outcomes_total = IntCounterVec::new(
            Opts::new(
                "auth_outcomes_total",
                "Login, registration and refresh outcomes",
            ),
            &["flow", "outcome"],
        )?;

        let rule_evaluations_total = IntCounterVec::new(
            Opts::new("rule_evaluations_total", "Rule engine decisions"),
            &["result"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(auth_outcomes_total.clone()))?;
        registry.register(Box::new(rule_evaluations_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            auth_outcomes_total,
            rule_evaluations_total,
        })
    }
}

/// Create and register collectors. Calling it again is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = Metrics::new()?;
    if METRICS.set(metrics).is_ok() {
        tracing::info!("Metrics registry initialized");
    }
    Ok(())
}

pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

pub fn record_auth_outcome(flow: &str, outcome: &str) {
    if let Some(m) = metrics() {
        m.auth_outcomes_total.with_label_values(&[flow, outcome]).inc();
    }
}

pub fn record_rule_evaluation(result: &str) {
    if let Some(m) = metrics() {
        m.rule_evaluations_total.with_label_values(&[result]).inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match metrics() {
        Some(m) => &m.registry,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}
