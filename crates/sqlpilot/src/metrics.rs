
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Registry, TextEncoder};
use std::sync::Once;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref GATE_VERDICTS: IntCounterVec = IntCounterVec::new(
        prometheus::opts!("gate_verdicts_total", "Safety gate verdicts by outcome"),
        &["verdict"]
    )
    .expect("gate_verdicts_total definition is valid");
    static ref GENERATIONS: IntCounterVec = IntCounterVec::new(
        prometheus::opts!("sql_generations_total", "SQL generation requests by outcome"),
        &["outcome"]
    )
    .expect("sql_generations_total definition is valid");
    static ref DISPATCHES: IntCounterVec = IntCounterVec::new(
        prometheus::opts!("dispatch_envelopes_total", "Dispatched envelopes by outcome"),
        &["outcome"]
    )
    .expect("dispatch_envelopes_total definition is valid");
    static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("inference_latency_seconds", "Inference call latency")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    )
    .expect("inference_latency_seconds definition is valid");
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(GATE_VERDICTS.clone())).ok();
        REGISTRY.register(Box::new(GENERATIONS.clone())).ok();
        REGISTRY.register(Box::new(DISPATCHES.clone())).ok();
        REGISTRY.register(Box::new(INFERENCE_LATENCY.clone())).ok();
    });
}

pub fn record_gate_verdict(verdict: &str) {
    GATE_VERDICTS.with_label_values(&[verdict]).inc();
}

pub fn record_generation(outcome: &str) {
    GENERATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_dispatch(outcome: &str) {
    DISPATCHES.with_label_values(&[outcome]).inc();
}

pub fn observe_inference(seconds: f64) {
    INFERENCE_LATENCY.observe(seconds);
}

/// Text exposition of every registered metric.
pub fn gather_text() -> String {
    init_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
