use crate::error::ScriptError;
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramVec, Registry, TextEncoder, opts,
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REQUEST_COUNTER: CounterVec = register_counter_vec_with_registry!(
        opts!(
            "scriptmock_requests_total",
            "Total number of requests served by mock instances"
        ),
        &["node", "outcome"],
        REGISTRY
    )
    .unwrap();
    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        "scriptmock_request_duration_seconds",
        "Histogram of mock request latencies in seconds",
        &["node"],
        REGISTRY
    )
    .unwrap();
    pub static ref SCRIPT_COUNTER: CounterVec = register_counter_vec_with_registry!(
        opts!(
            "scriptmock_condition_scripts_total",
            "Condition script evaluations by verdict"
        ),
        &["verdict"],
        REGISTRY
    )
    .unwrap();
}

pub fn register_process_metrics() {
    #[cfg(target_os = "linux")]
    {
        let process_collector = prometheus::process_collector::ProcessCollector::for_self();
        if let Err(e) = REGISTRY.register(Box::new(process_collector)) {
            tracing::warn!("Process metrics unavailable: {}", e);
        }
    }
}

pub fn record_request(node_id: &str, outcome: &str, seconds: f64) {
    REQUEST_COUNTER.with_label_values(&[node_id, outcome]).inc();
    REQUEST_DURATION.with_label_values(&[node_id]).observe(seconds);
}

pub fn record_script(verdict: &Result<bool, ScriptError>) {
    let label = match verdict {
        Ok(true) => "true",
        Ok(false) => "false",
        Err(ScriptError::Timeout(_)) => "timeout",
        Err(_) => "error",
    };
    SCRIPT_COUNTER.with_label_values(&[label]).inc();
}

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
