use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Unused by the headless worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Key expected in the `x-api-key` header of every `/api` request
    pub api_key: String,

    /// Redis connection string for the message broker
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Root directory for labeled images and trained models
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    // Provider credentials. Any subset may be set; priority is fixed.
    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[serde(default = "default_openrouter_model")]
    pub openrouter_model: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,

    #[serde(default = "default_openrouter_base_url")]
    pub openrouter_base_url: String,
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,

    /// Per-request timeout for provider calls
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Default images per chunk for medium batches
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Upper bound on chunks classified at the same time
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,

    /// Concurrent HEAD probes while filtering a batch
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    // Broker topology
    #[serde(default = "default_classify_stream")]
    pub classify_stream: String,
    #[serde(default = "default_train_stream")]
    pub train_stream: String,
    #[serde(default = "default_export_stream")]
    pub export_stream: String,
    #[serde(default = "default_response_stream")]
    pub response_stream: String,
    #[serde(default = "default_progress_stream")]
    pub progress_stream: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Group that stands in for the durable response queue bound to the fanout
    #[serde(default = "default_response_group")]
    pub response_group: String,
    #[serde(default = "default_progress_group")]
    pub progress_group: String,
    /// Consumer name inside the group. Generated per process when unset.
    #[serde(default)]
    pub consumer_name: Option<String>,
    #[serde(default = "default_response_max_len")]
    pub response_max_len: u64,
    #[serde(default = "default_poll_block_ms")]
    pub poll_block_ms: u64,
    /// Pending entries idle longer than this are taken over on (re)connect
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    // Connection resilience
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_secs")]
    pub circuit_recovery_secs: u64,
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,
    #[serde(default = "default_publish_max_retries")]
    pub publish_max_retries: u32,
    #[serde(default = "default_publish_base_secs")]
    pub publish_base_secs: u64,
    #[serde(default = "default_publish_max_secs")]
    pub publish_max_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// External trainer executable used for train and export jobs
    #[serde(default = "default_trainer_command")]
    pub trainer_command: String,
    #[serde(default = "default_train_epochs")]
    pub default_epochs: u32,
    #[serde(default = "default_train_imgsz")]
    pub default_imgsz: u32,
    #[serde(default = "default_export_format")]
    pub default_export_format: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_base_dir() -> String {
    "/data/autoClass".to_string()
}

fn default_openrouter_model() -> String {
    "google/gemini-2.5-flash".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_openai_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_chunk_size() -> usize {
    8
}

fn default_max_concurrent_chunks() -> usize {
    10
}

fn default_probe_concurrency() -> usize {
    16
}

fn default_classify_stream() -> String {
    "classify:requests".to_string()
}

fn default_train_stream() -> String {
    "train:requests".to_string()
}

fn default_export_stream() -> String {
    "export:requests".to_string()
}

fn default_response_stream() -> String {
    "classify:responses".to_string()
}

fn default_progress_stream() -> String {
    "train:progress".to_string()
}

fn default_consumer_group() -> String {
    "classify-gateway".to_string()
}

fn default_response_group() -> String {
    "classify-responses".to_string()
}

fn default_progress_group() -> String {
    "train-progress".to_string()
}

fn default_response_max_len() -> u64 {
    10_000
}

fn default_poll_block_ms() -> u64 {
    1000
}

fn default_claim_idle_ms() -> u64 {
    300_000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_recovery_secs() -> u64 {
    60
}

fn default_reconnect_base_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_reconnect_max_retries() -> u32 {
    5
}

fn default_publish_max_retries() -> u32 {
    3
}

fn default_publish_base_secs() -> u64 {
    5
}

fn default_publish_max_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_trainer_command() -> String {
    "autoclass-trainer".to_string()
}

fn default_train_epochs() -> u32 {
    10
}

fn default_train_imgsz() -> u32 {
    416
}

fn default_export_format() -> String {
    "onnx".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> AppConfig {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()));
        envy::from_iter(vars).expect("config should deserialize")
    }

    #[test]
    fn test_defaults_apply_when_only_api_key_is_set() {
        let config = from_pairs(&[("API_KEY", "secret")]);
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.chunk_size, 8);
        assert_eq!(config.max_concurrent_chunks, 10);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_recovery_secs, 60);
        assert_eq!(config.reconnect_base_secs, 5);
        assert_eq!(config.reconnect_max_secs, 60);
        assert_eq!(config.publish_max_retries, 3);
        assert_eq!(config.default_epochs, 10);
        assert_eq!(config.default_imgsz, 416);
        assert_eq!(config.default_export_format, "onnx");
        assert!(config.openrouter_api_key.is_none());
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_api_key_is_an_error() {
        let vars: Vec<(String, String)> = Vec::new();
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }

    #[test]
    fn test_overrides_are_read() {
        let config = from_pairs(&[
            ("API_KEY", "k"),
            ("OPENAI_API_KEY", "sk-test"),
            ("CHUNK_SIZE", "4"),
            ("CLASSIFY_STREAM", "jobs:classify"),
        ]);
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.chunk_size, 4);
        assert_eq!(config.classify_stream, "jobs:classify");
    }
}
