//! Configuration management for CondoPortal services
//!
//! Supports loading configuration from:
//! - A `.env` file (loaded by the binaries with dotenvy)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Environment variables (prefixed with APP__)
//! - Default values
//!
//! Loading never fails on missing credentials; [`AppConfig::validate`]
//! reports every missing or invalid setting at once so the operator can fix
//! the environment in a single pass.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Firebase project configuration
    #[serde(default)]
    pub firebase: FirebaseConfig,

    /// Dify knowledge base and workflow configuration
    #[serde(default)]
    pub dify: DifyConfig,

    /// Gemini OCR configuration
    #[serde(default)]
    pub gemini: GeminiConfig,

    /// Ingestion pipeline configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Document record storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (uploads include OCR, keep this generous)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Allowed CORS origin ("*" for any)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FirebaseConfig {
    /// Firebase / GCP project id
    #[serde(default)]
    pub project_id: String,

    /// Web API key (Identity Toolkit)
    #[serde(default)]
    pub api_key: String,

    /// Storage bucket, e.g. `my-project.appspot.com`
    #[serde(default)]
    pub storage_bucket: String,

    /// Firestore collection for document records
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Firestore REST base URL override (emulators, tests)
    pub firestore_base_url: Option<String>,

    /// Storage REST base URL override
    pub storage_base_url: Option<String>,

    /// Identity Toolkit base URL override
    pub identity_base_url: Option<String>,

    /// Secure Token base URL override
    pub secure_token_base_url: Option<String>,

    /// JWKS URL for ID-token signing keys
    #[serde(default = "default_jwks_url")]
    pub jwks_url: String,

    /// How long fetched signing keys are trusted, in seconds
    #[serde(default = "default_jwks_ttl")]
    pub jwks_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DifyConfig {
    /// API base URL, including the `/v1` suffix
    #[serde(default = "default_dify_base_url")]
    pub base_url: String,

    /// Dataset (knowledge base) API key
    #[serde(default)]
    pub dataset_api_key: String,

    /// Dataset id documents are ingested into
    #[serde(default)]
    pub dataset_id: String,

    /// Workflow app API key used for question answering
    #[serde(default)]
    pub workflow_api_key: String,

    /// Workflow output variable holding the answer
    #[serde(default = "default_answer_key")]
    pub answer_output_key: String,

    /// Separator placed between chunks so Dify keeps our boundaries
    #[serde(default = "default_segment_separator")]
    pub segment_separator: String,

    /// Upper bound Dify applies to a single segment, in tokens
    #[serde(default = "default_segment_max_tokens")]
    pub segment_max_tokens: u32,

    /// Default number of retrieval results
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Default minimum retrieval score (None disables the threshold)
    pub score_threshold: Option<f64>,

    /// Request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// Maximum total time spent retrying a call, in seconds
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeminiConfig {
    /// Gemini API key
    #[serde(default)]
    pub api_key: String,

    /// Model used for OCR
    #[serde(default = "default_gemini_model")]
    pub model: String,

    /// API base URL
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_gemini_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    /// Average non-whitespace characters per page required to trust direct extraction
    #[serde(default = "default_min_chars_per_page")]
    pub min_chars_per_page: usize,

    /// Maximum share of unreadable characters tolerated in extracted text
    #[serde(default = "default_max_garbage_ratio")]
    pub max_garbage_ratio: f64,

    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between chunks in characters
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Maximum page images sent to OCR for one document
    #[serde(default = "default_max_ocr_images")]
    pub max_ocr_images: usize,
}

/// Where document records live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Full record in a Firestore collection
    #[default]
    Firestore,
    /// Records derived from the Dify knowledge base only
    KnowledgeBase,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log filter (tracing EnvFilter syntax)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Expose Prometheus metrics at /metrics
    #[serde(default = "default_enabled")]
    pub metrics_enabled: bool,

    /// Service name reported in logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 120 }
fn default_max_concurrent() -> usize { 64 }
fn default_cors_origin() -> String { "*".to_string() }
fn default_collection() -> String { crate::DEFAULT_COLLECTION.to_string() }
fn default_jwks_url() -> String {
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com"
        .to_string()
}
fn default_jwks_ttl() -> u64 { 3600 }
fn default_dify_base_url() -> String { "https://api.dify.ai/v1".to_string() }
fn default_answer_key() -> String { "answer".to_string() }
fn default_segment_separator() -> String { "\n\n<<<chunk>>>\n\n".to_string() }
fn default_segment_max_tokens() -> u32 { 1000 }
fn default_top_k() -> u32 { 5 }
fn default_upstream_timeout() -> u64 { 60 }
fn default_retry_budget() -> u64 { 30 }
fn default_gemini_model() -> String { crate::DEFAULT_GEMINI_MODEL.to_string() }
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_gemini_timeout() -> u64 { 90 }
fn default_min_chars_per_page() -> usize { 50 }
fn default_max_garbage_ratio() -> f64 { 0.1 }
fn default_chunk_size() -> usize { 1000 }
fn default_chunk_overlap() -> usize { 100 }
fn default_max_upload_bytes() -> usize { 25 * 1024 * 1024 }
fn default_max_ocr_images() -> usize { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_service_name() -> String { "condoportal".to_string() }
fn default_rate_limit() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent(),
            cors_origin: default_cors_origin(),
        }
    }
}

impl Default for DifyConfig {
    fn default() -> Self {
        Self {
            base_url: default_dify_base_url(),
            dataset_api_key: String::new(),
            dataset_id: String::new(),
            workflow_api_key: String::new(),
            answer_output_key: default_answer_key(),
            segment_separator: default_segment_separator(),
            segment_max_tokens: default_segment_max_tokens(),
            top_k: default_top_k(),
            score_threshold: None,
            timeout_secs: default_upstream_timeout(),
            retry_budget_secs: default_retry_budget(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
            timeout_secs: default_gemini_timeout(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            min_chars_per_page: default_min_chars_per_page(),
            max_garbage_ratio: default_max_garbage_ratio(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_upload_bytes: default_max_upload_bytes(),
            max_ocr_images: default_max_ocr_images(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_enabled: default_enabled(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            firebase: FirebaseConfig {
                collection: default_collection(),
                jwks_url: default_jwks_url(),
                jwks_ttl_secs: default_jwks_ttl(),
                ..FirebaseConfig::default()
            },
            dify: DifyConfig::default(),
            gemini: GeminiConfig::default(),
            ingestion: IngestionConfig::default(),
            storage: StorageConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__DIFY__DATASET_ID=...
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific config file, still honoring APP__ overrides
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check required settings, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        let required = [
            ("firebase.project_id", &self.firebase.project_id),
            ("firebase.api_key", &self.firebase.api_key),
            ("firebase.storage_bucket", &self.firebase.storage_bucket),
            ("dify.dataset_api_key", &self.dify.dataset_api_key),
            ("dify.dataset_id", &self.dify.dataset_id),
            ("dify.workflow_api_key", &self.dify.workflow_api_key),
            ("gemini.api_key", &self.gemini.api_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                problems.push(format!("{} is required", name));
            }
        }

        if self.dify.segment_separator.trim().is_empty() {
            problems.push("dify.segment_separator must contain a visible marker".to_string());
        }
        if self.ingestion.chunk_size == 0 {
            problems.push("ingestion.chunk_size must be greater than 0".to_string());
        }
        if self.ingestion.chunk_overlap >= self.ingestion.chunk_size {
            problems.push("ingestion.chunk_overlap must be smaller than ingestion.chunk_size".to_string());
        }
        if !(0.0..=1.0).contains(&self.ingestion.max_garbage_ratio) {
            problems.push("ingestion.max_garbage_ratio must be between 0 and 1".to_string());
        }
        if let Some(threshold) = self.dify.score_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                problems.push("dify.score_threshold must be between 0 and 1".to_string());
            }
        }
        if self.rate_limit.enabled && (self.rate_limit.requests_per_second == 0 || self.rate_limit.burst == 0) {
            problems.push("rate_limit.requests_per_second and rate_limit.burst must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Firestore REST root for the configured project's default database
    pub fn firestore_documents_url(&self) -> String {
        let base = self
            .firebase
            .firestore_base_url
            .as_deref()
            .unwrap_or("https://firestore.googleapis.com/v1");
        format!(
            "{}/projects/{}/databases/(default)/documents",
            base.trim_end_matches('/'),
            self.firebase.project_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> AppConfig {
        let mut config = AppConfig::default();
        config.firebase.project_id = "condo-test".into();
        config.firebase.api_key = "web-key".into();
        config.firebase.storage_bucket = "condo-test.appspot.com".into();
        config.dify.dataset_api_key = "dataset-key".into();
        config.dify.dataset_id = "ds-1".into();
        config.dify.workflow_api_key = "app-key".into();
        config.gemini.api_key = "gemini-key".into();
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.firebase.collection, "documents");
        assert_eq!(config.gemini.model, "gemini-2.0-flash");
        assert_eq!(config.storage.backend, StorageBackend::Firestore);
    }

    #[test]
    fn test_validate_reports_every_missing_key() {
        let problems = AppConfig::default().validate().unwrap_err();
        assert_eq!(problems.len(), 7);
        assert!(problems.iter().any(|p| p.starts_with("dify.dataset_id")));
        assert!(problems.iter().any(|p| p.starts_with("gemini.api_key")));
    }

    #[test]
    fn test_validate_complete_config() {
        assert!(complete().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap_not_smaller_than_chunk() {
        let mut config = complete();
        config.ingestion.chunk_overlap = config.ingestion.chunk_size;
        let problems = config.validate().unwrap_err();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("chunk_overlap"));
    }

    #[test]
    fn test_firestore_documents_url() {
        let config = complete();
        assert_eq!(
            config.firestore_documents_url(),
            "https://firestore.googleapis.com/v1/projects/condo-test/databases/(default)/documents"
        );
    }

    #[test]
    fn test_storage_backend_names() {
        let backend: StorageBackend = serde_json::from_str("\"knowledge_base\"").unwrap();
        assert_eq!(backend, StorageBackend::KnowledgeBase);
    }
}
