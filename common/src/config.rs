// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
}

/// Remote calendar publishing service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    /// Value sent as `KIND=` when the entity carries no hint of its own
    pub client_hint: String,
    /// Current semester flag (`S=0|1`); derived from the date when unset
    #[serde(default)]
    pub semester: Option<u8>,
    pub request_timeout_seconds: u64,
    pub entity_timeout_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// PostgREST-compatible HTTP API
    Rest,
    /// Direct PostgreSQL connection
    Postgres,
    /// In-process store, nothing is persisted
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    /// Apply bundled migrations on startup (postgres backend only)
    #[serde(default)]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Concurrent calendar fetches
    pub concurrency: usize,
    /// Entities per fetch/reconcile batch
    pub batch_size: usize,
    /// Rows per upsert call
    pub chunk_size: usize,
    /// Zone used for floating calendar times
    pub timezone: String,
    #[serde(default)]
    pub seeds_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("PLANSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            // Deployment variables shared with the hosted store
            .set_override_option(
                "store.url",
                legacy_var("STORE__URL", &["SUPABASE_URL", "DATABASE_URL"]),
            )?
            .set_override_option(
                "store.api_key",
                legacy_var("STORE__API_KEY", &["SUPABASE_SERVICE_ROLE_KEY"]),
            )?;

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.source.base_url.is_empty() {
            return Err("Source base_url cannot be empty".to_string());
        }
        if let Some(semester) = self.source.semester {
            if semester > 1 {
                return Err("Source semester must be 0 or 1".to_string());
            }
        }
        if self.source.request_timeout_seconds == 0 || self.source.entity_timeout_seconds == 0 {
            return Err("Source timeouts must be greater than 0".to_string());
        }

        match self.store.backend {
            StoreBackend::Memory => {}
            StoreBackend::Rest => {
                if self.store.url.is_empty() {
                    return Err("Store URL cannot be empty".to_string());
                }
                if self.store.api_key.as_deref().unwrap_or("").is_empty() {
                    return Err("Store api_key is required for the rest backend".to_string());
                }
            }
            StoreBackend::Postgres => {
                if self.store.url.is_empty() {
                    return Err("Store URL cannot be empty".to_string());
                }
                if self.store.max_connections == 0 {
                    return Err("Store max_connections must be greater than 0".to_string());
                }
            }
        }

        if self.sync.concurrency == 0 {
            return Err("Sync concurrency must be greater than 0".to_string());
        }
        if self.sync.batch_size == 0 {
            return Err("Sync batch_size must be greater than 0".to_string());
        }
        if self.sync.chunk_size == 0 {
            return Err("Sync chunk_size must be greater than 0".to_string());
        }
        if self.sync.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!("Unknown timezone: {}", self.sync.timezone));
        }

        if self.retry.max_attempts == 0 {
            return Err("Retry max_attempts must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err("Retry jitter_factor must be between 0.0 and 1.0".to_string());
        }

        Ok(())
    }
}

/// First non-empty legacy variable, unless the prefixed variable is set
fn legacy_var(prefixed: &str, names: &[&str]) -> Option<String> {
    if std::env::var(format!("PLANSYNC__{}", prefixed)).is_ok() {
        return None;
    }
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.is_empty())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                base_url: "https://plan.uz.zgora.pl".to_string(),
                client_hint: "GG".to_string(),
                semester: None,
                request_timeout_seconds: 15,
                entity_timeout_seconds: 60,
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                url: String::new(),
                api_key: None,
                max_connections: 10,
                min_connections: 1,
                connect_timeout_seconds: 30,
                run_migrations: false,
            },
            sync: SyncConfig {
                concurrency: 20,
                batch_size: 100,
                chunk_size: 1000,
                timezone: "Europe/Warsaw".to_string(),
                seeds_path: None,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 8000,
                jitter_factor: 0.1,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}
