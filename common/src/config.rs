use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Extra source definitions merged over the built-in catalog.
    #[serde(default)]
    pub sources_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Local,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_s3_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_bronze_bucket")]
    pub bronze_bucket: String,
    /// Root directory for the `local` backend.
    #[serde(default = "default_local_root")]
    pub local_root: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    IngestionLog,
    SourceTable,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_evidence")]
    pub evidence: EvidenceKind,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationConfig {
    #[serde(default)]
    pub failure_webhook_url: Option<String>,
    #[serde(default)]
    pub downstream_webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttls")]
    pub ttls: HashMap<String, u64>,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            endpoint: default_s3_endpoint(),
            region: default_s3_region(),
            access_key: String::new(),
            secret_key: String::new(),
            bronze_bucket: default_bronze_bucket(),
            local_root: default_local_root(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            evidence: default_evidence(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttls: default_cache_ttls(),
            default_ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, role: &str) -> u64 {
        self.ttls
            .get(role)
            .copied()
            .unwrap_or(self.default_ttl_secs)
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::S3
}

fn default_s3_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_bronze_bucket() -> String {
    "bronze".to_string()
}

fn default_local_root() -> String {
    "data".to_string()
}

fn default_page_size() -> usize {
    50_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_evidence() -> EvidenceKind {
    EvidenceKind::IngestionLog
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_ttls() -> HashMap<String, u64> {
    HashMap::from([
        ("agent".to_string(), 30),
        ("manager".to_string(), 60),
        ("hr".to_string(), 60),
    ])
}

fn default_cache_ttl() -> u64 {
    60
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        debug!(
            storage = ?settings.storage.backend,
            page_size = settings.pipeline.page_size,
            max_connections = settings.database.max_connections,
            "Loaded settings"
        );

        Ok(settings)
    }
}
