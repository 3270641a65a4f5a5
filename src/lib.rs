//! Image classification gateway
//!
//! Classifies batches of image URLs into caller-supplied categories through a
//! chain of AI providers, and runs training/export jobs. Work arrives over
//! HTTP or from Redis Streams; broker jobs are answered on a response stream
//! tagged with the caller's correlation id.

pub mod app_state;
pub mod broker;
pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod routes;
pub mod services;
pub mod supervisor;

/// Register descriptions for every metric the gateway records.
pub fn describe_metrics() {
    metrics::describe_counter!("classify_jobs_total", "Classification jobs started");
    metrics::describe_counter!(
        "classify_images_filtered_total",
        "Images dropped because their URL is not a PNG/JPEG"
    );
    metrics::describe_counter!(
        "classify_chunks_failed_total",
        "Image chunks degraded to NONE after a failure"
    );
    metrics::describe_histogram!("classify_job_seconds", "Time to classify one job's images");
    metrics::describe_counter!(
        "provider_fallbacks_total",
        "Times a provider failed and the next one was tried"
    );
    metrics::describe_counter!(
        "broker_connect_failures_total",
        "Broker connect cycles that exhausted their attempts"
    );
    metrics::describe_counter!("responses_published_total", "Responses written to the response stream");
    metrics::describe_counter!(
        "responses_publish_failed_total",
        "Responses that could not be published after all retries"
    );
    metrics::describe_counter!("broker_messages_total", "Broker entries handled, by queue and outcome");
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time from delivery to settlement, by queue"
    );
}
