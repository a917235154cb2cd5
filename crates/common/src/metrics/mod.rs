//! Metrics and observability utilities
//!
//! Prometheus metrics with standardized naming. Every name carries the
//! `condoportal` prefix.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all CondoPortal metrics
pub const METRICS_PREFIX: &str = "condoportal";

/// Histogram buckets for API request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.00,
];

/// Buckets for ingestion and workflow runs, which include OCR and LLM calls
pub const PIPELINE_BUCKETS: &[f64] = &[
    0.250, 0.500, 1.000, 2.500, 5.000, 10.00, 30.00, 60.00, 120.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Upload and ingestion metrics
    describe_counter!(
        format!("{}_uploads_total", METRICS_PREFIX),
        Unit::Count,
        "Document uploads by outcome"
    );

    describe_counter!(
        format!("{}_ingestions_total", METRICS_PREFIX),
        Unit::Count,
        "Documents ingested by extraction method"
    );

    describe_counter!(
        format!("{}_ocr_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Ingestions that fell back to OCR, by OCR mode"
    );

    describe_counter!(
        format!("{}_chunks_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total chunks sent to the knowledge base"
    );

    describe_histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Ingestion pipeline latency in seconds"
    );

    // Retrieval and question answering
    describe_counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total knowledge base searches"
    );

    describe_histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Knowledge base search latency in seconds"
    );

    describe_counter!(
        format!("{}_questions_total", METRICS_PREFIX),
        Unit::Count,
        "Questions sent to the answering workflow, by outcome"
    );

    describe_histogram!(
        format!("{}_question_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Workflow run latency in seconds"
    );

    describe_counter!(
        format!("{}_workflow_tokens_total", METRICS_PREFIX),
        Unit::Count,
        "LLM tokens reported by workflow runs"
    );

    describe_counter!(
        format!("{}_upstream_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Failed calls to managed services"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record the outcome of an upload request
pub fn record_upload(outcome: &str) {
    counter!(
        format!("{}_uploads_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a finished ingestion
pub fn record_ingestion(duration_secs: f64, method: &str, chunks_created: usize) {
    counter!(
        format!("{}_ingestions_total", METRICS_PREFIX),
        "method" => method.to_string()
    )
    .increment(1);

    counter!(format!("{}_chunks_created_total", METRICS_PREFIX)).increment(chunks_created as u64);

    histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        "method" => method.to_string()
    )
    .record(duration_secs);
}

/// Record an OCR fallback (`images` or `pdf`)
pub fn record_ocr_fallback(mode: &str) {
    counter!(
        format!("{}_ocr_fallbacks_total", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .increment(1);
}

/// Record a knowledge base search
pub fn record_search(duration_secs: f64, result_count: usize) {
    counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        "empty" => (result_count == 0).to_string()
    )
    .increment(1);

    histogram!(format!("{}_search_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Record a workflow run for a question
pub fn record_question(duration_secs: f64, total_tokens: Option<u64>) {
    let outcome = if total_tokens.is_some() { "answered" } else { "failed" };

    counter!(
        format!("{}_questions_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);

    histogram!(format!("{}_question_duration_seconds", METRICS_PREFIX)).record(duration_secs);

    if let Some(tokens) = total_tokens {
        counter!(format!("{}_workflow_tokens_total", METRICS_PREFIX)).increment(tokens);
    }
}

/// Record a failed call to a managed service
pub fn record_upstream_error(service: &str) {
    counter!(
        format!("{}_upstream_errors_total", METRICS_PREFIX),
        "service" => service.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_are_sorted() {
        for buckets in [LATENCY_BUCKETS, PIPELINE_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every helper must be a no-op
        let metrics = RequestMetrics::start("GET", "/v1/documents");
        metrics.finish(200);
        record_upload("stored");
        record_ingestion(1.5, "ocr", 12);
        record_ocr_fallback("pdf");
        record_search(0.2, 0);
        record_question(3.0, Some(420));
        record_upstream_error("dify");
    }
}
