use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_MAX_EMBEDDINGS: u64 = 100_000;
const DEFAULT_BUCKET_FANOUT: u32 = 512;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEV_SERVER_SECRET: &str = "insecure-dev-secret";

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub search: SearchSection,
    pub limits: LimitsSection,
    pub security: SecuritySection,
    pub he: HeSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("SECURE_SEARCH_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SECURE_SEARCH")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings
            .try_deserialize()
            .context("invalid configuration")?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        Ok(config)
    }

    /// True when the plane seed secret was left on the development default.
    pub fn uses_dev_secret(&self) -> bool {
        self.security.server_secret == DEV_SERVER_SECRET
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: String,
    pub pool_size: u32,
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: "./data/secure-search.db".to_string(),
            pool_size: 16,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    /// Per-bucket read bound; oversized buckets are deterministically subsampled
    pub max_bucket_fanout: u32,
    /// Wall-clock budget per request in seconds
    pub request_timeout_secs: u64,
    /// Number of per-client plane matrices kept in memory
    pub plane_cache_capacity: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            max_bucket_fanout: DEFAULT_BUCKET_FANOUT,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            plane_cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Per-client embedding quota
    pub max_embeddings: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_embeddings: DEFAULT_MAX_EMBEDDINGS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Seed material for per-client plane regeneration. Must be stable across
    /// restarts or previously distributed planes stop matching.
    pub server_secret: String,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            server_secret: DEV_SERVER_SECRET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeSection {
    /// Scheme tags routed to a codec name, e.g. `CKKS -> mock` when no
    /// hardware-backed codec is linked into this build.
    pub scheme_aliases: HashMap<String, String>,
}

impl Default for HeSection {
    fn default() -> Self {
        let mut scheme_aliases = HashMap::new();
        scheme_aliases.insert("CKKS".to_string(), "mock".to_string());
        Self { scheme_aliases }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}
