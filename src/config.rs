//! Runtime configuration
//!
//! Loaded from an optional TOML file and overridden by `DYNHASHTAG__*`
//! environment variables (e.g. `DYNHASHTAG__FILTER__TOP_K=5`).

use crate::filter::terms::ExpansionPolicy;
use crate::storage::libsql::ConnectionMode;
use crate::text::Language;
use crate::types::QuerySet;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "DYNHASHTAG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to load config: {0}")]
    LoadError(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseMode {
    #[default]
    Local,
    Memory,
    Remote,
}

/// Document store connection parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub mode: DatabaseMode,

    /// Database file for `local` mode; defaults to the user data directory
    #[serde(default)]
    pub path: Option<String>,

    /// libSQL server URL for `remote` mode
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub auth_token: Option<String>,
}

impl DatabaseConfig {
    pub fn connection_mode(&self) -> Result<ConnectionMode, ConfigError> {
        match self.mode {
            DatabaseMode::Local => Ok(ConnectionMode::Local(
                self.path.clone().unwrap_or_else(default_db_path),
            )),
            DatabaseMode::Memory => Ok(ConnectionMode::InMemory),
            DatabaseMode::Remote => {
                let url = self.url.clone().ok_or_else(|| {
                    ConfigError::ValidationError("database.url is required in remote mode".into())
                })?;
                Ok(ConnectionMode::Remote {
                    url,
                    token: self.auth_token.clone().unwrap_or_default(),
                })
            }
        }
    }
}

/// Default database location under the user's data directory
pub fn default_db_path() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("dynhashtag")
        .join("dynhashtag.db")
        .to_string_lossy()
        .to_string()
}

/// Streaming API endpoints and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Endpoint of the filtered stream; `track` and `follow` are appended
    pub filter_url: String,

    /// Endpoint of the unfiltered random sample stream
    pub sample_url: String,

    /// Bearer token sent with every subscription request
    pub access_token: Option<String>,

    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,

    /// Consecutive failed connection attempts before the loop gives up (0 = never)
    pub max_reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            filter_url: "http://localhost:8080/stream/filter".to_string(),
            sample_url: "http://localhost:8080/stream/sample".to_string(),
            access_token: None,
            connect_timeout_secs: 30,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 60,
            max_reconnect_attempts: 12,
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

/// Retraining and query-expansion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of expansion keywords selected per cycle (TOP_K)
    pub top_k: usize,

    /// Retrain interval and positive-corpus window, in hours (REMODEL)
    pub remodel_hours: u64,

    /// Stop-word languages (LANGUAGE)
    pub languages: Vec<Language>,

    /// An author must appear in more than this many positive documents
    pub min_author_documents: usize,

    /// Budget for collecting the negative sample
    pub sample_timeout_secs: u64,

    pub expansion: ExpansionPolicy,

    /// How often the ingestion loop polls the handoff while idle
    pub handoff_poll_millis: u64,

    /// Number of finished retrain jobs kept for inspection
    pub history_limit: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            remodel_hours: 6,
            languages: vec![Language::English],
            min_author_documents: 10,
            sample_timeout_secs: 600,
            expansion: ExpansionPolicy::Expand,
            handoff_poll_millis: 1000,
            history_limit: 32,
        }
    }
}

impl FilterConfig {
    pub fn remodel_interval(&self) -> Duration {
        Duration::from_secs(self.remodel_hours * 3600)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }

    pub fn handoff_poll(&self) -> Duration {
        Duration::from_millis(self.handoff_poll_millis)
    }
}

/// Seed query the topic starts from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            keywords: vec!["obama".to_string(), "usa".to_string()],
            authors: Vec::new(),
        }
    }
}

impl SeedConfig {
    pub fn query_set(&self) -> QuerySet {
        QuerySet::new(&self.keywords, &self.authors)
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        } else {
            builder = builder.add_source(
                ::config::File::with_name("dynhashtag")
                    .format(::config::FileFormat::Toml)
                    .required(false),
            );
        }

        let config: AppConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filter.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "filter.top_k must be at least 1".to_string(),
            ));
        }

        if self.filter.remodel_hours == 0 {
            return Err(ConfigError::ValidationError(
                "filter.remodel_hours must be at least 1".to_string(),
            ));
        }

        if self.filter.sample_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "filter.sample_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.filter.handoff_poll_millis == 0 {
            return Err(ConfigError::ValidationError(
                "filter.handoff_poll_millis must be at least 1".to_string(),
            ));
        }

        if self.stream.reconnect_delay_secs == 0
            || self.stream.reconnect_delay_secs > self.stream.max_reconnect_delay_secs
        {
            return Err(ConfigError::ValidationError(format!(
                "stream.reconnect_delay_secs must be between 1 and {}",
                self.stream.max_reconnect_delay_secs
            )));
        }

        if self.seed.query_set().is_empty() {
            return Err(ConfigError::ValidationError(
                "seed query needs at least one keyword or author".to_string(),
            ));
        }

        Ok(())
    }
}
