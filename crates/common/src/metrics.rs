//! Metrics collection for ChatGate
//!
//! This module provides Prometheus metrics for observability.
//! Updates are plain atomic operations so they can sit on the request path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ChatGate
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub chat: ChatMetrics,
    pub inference: InferenceMetrics,
}

/// Request-level metrics for `/chat`
#[derive(Debug, Clone)]
pub struct ChatMetrics {
    /// Total number of chat requests
    pub requests_total: IntCounter,

    /// Requests answered with a generation
    pub requests_success: IntCounter,

    /// Requests that failed server-side
    pub requests_failed: IntCounter,

    /// Requests rejected by validation
    pub requests_rejected: IntCounter,

    /// End-to-end request duration (queueing included)
    pub request_duration: Histogram,

    /// Requests waiting for an admission slot
    pub queued_requests: IntGauge,
}

/// Inference-related metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Generations currently holding an admission slot
    pub active_inferences: IntGauge,

    /// Duration of the tokenize/generate/decode job
    pub generation_duration: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Resource load executions
    pub resource_loads_total: IntCounter,

    /// Resource load executions that failed
    pub resource_load_failures: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Chat metrics
        let requests_total = IntCounter::new(
            "chat_requests_total",
            "Total number of chat requests"
        ).unwrap();

        let requests_success = IntCounter::new(
            "chat_requests_success_total",
            "Total number of successful chat requests"
        ).unwrap();

        let requests_failed = IntCounter::new(
            "chat_requests_failed_total",
            "Total number of chat requests that failed server-side"
        ).unwrap();

        let requests_rejected = IntCounter::new(
            "chat_requests_rejected_total",
            "Total number of chat requests rejected by validation"
        ).unwrap();

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chat_request_duration_seconds",
                "Chat request duration in seconds, queueing included"
            ).buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
        ).unwrap();

        let queued_requests = IntGauge::new(
            "chat_queued_requests",
            "Chat requests waiting for an admission slot"
        ).unwrap();

        // Inference metrics
        let active_inferences = IntGauge::new(
            "inference_active",
            "Generations currently holding an admission slot"
        ).unwrap();

        let generation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "inference_generation_duration_seconds",
                "Tokenize, generate and decode duration in seconds"
            ).buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
        ).unwrap();

        let tokens_generated_total = IntCounter::new(
            "inference_tokens_generated_total",
            "Total number of tokens generated"
        ).unwrap();

        let resource_loads_total = IntCounter::new(
            "inference_resource_loads_total",
            "Model and tokenizer load executions"
        ).unwrap();

        let resource_load_failures = IntCounter::new(
            "inference_resource_load_failures_total",
            "Model and tokenizer load executions that failed"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_success.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(requests_rejected.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(queued_requests.clone())).unwrap();

        registry.register(Box::new(active_inferences.clone())).unwrap();
        registry.register(Box::new(generation_duration.clone())).unwrap();
        registry.register(Box::new(tokens_generated_total.clone())).unwrap();
        registry.register(Box::new(resource_loads_total.clone())).unwrap();
        registry.register(Box::new(resource_load_failures.clone())).unwrap();

        let chat = ChatMetrics {
            requests_total,
            requests_success,
            requests_failed,
            requests_rejected,
            request_duration,
            queued_requests,
        };

        let inference = InferenceMetrics {
            active_inferences,
            generation_duration,
            tokens_generated_total,
            resource_loads_total,
            resource_load_failures,
        };

        MetricsRegistry {
            registry,
            chat,
            inference,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
