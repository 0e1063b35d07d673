//! Configuration System
//!
//! Handles loading service configuration from files and environment variables.
//! Supports TOML config files and `HEARTH_*` environment variable overrides.
//!
//! Analysis settings (exclusions, domain flags, tunables) live in a separate
//! file re-read at the start of every run; see [`crate::settings`].

use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analysis::AnalysisEngine;
use crate::events::CsvEventSource;
use crate::patterns::{SqlitePatternStore, StoreError};
use crate::settings::FileSettingsProvider;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pattern store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("hearth").join("patterns.db").to_string_lossy().to_string())
        .unwrap_or_else(|| "./hearth_data/patterns.db".to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Event history configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Recorder CSV export of state changes
    #[serde(default = "default_events_csv")]
    pub csv_path: String,

    /// Optional CSV of automation firings
    #[serde(default)]
    pub automations_csv_path: Option<String>,

    /// Local offset used to derive time slots and weekday types
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_events_csv() -> String {
    "./events.csv".to_string()
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            csv_path: default_events_csv(),
            automations_csv_path: None,
            utc_offset_minutes: 0,
        }
    }
}

/// Analysis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Exclusions, domain flags and tunables
    #[serde(default = "default_settings_path")]
    pub settings_path: String,
}

fn default_settings_path() -> String {
    "./settings.toml".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            settings_path: default_settings_path(),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8086
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ApiConfig {
    /// Server-side settings for [`crate::api::serve`]
    pub fn to_server_config(&self) -> crate::api::ApiConfig {
        crate::api::ApiConfig {
            request_timeout_ms: self.request_timeout_secs * 1000,
            ..crate::api::ApiConfig::new(self.host.clone(), self.port)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("hearth").join("config.toml")),
            Some(PathBuf::from("/etc/hearth/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("HEARTH_DB_PATH") {
            self.store.path = path;
        }

        if let Some(path) = var("HEARTH_EVENTS_CSV") {
            self.events.csv_path = path;
        }
        if let Some(path) = var("HEARTH_AUTOMATIONS_CSV") {
            self.events.automations_csv_path = Some(path);
        }

        if let Some(path) = var("HEARTH_SETTINGS") {
            self.analysis.settings_path = path;
        }

        if let Some(host) = var("HEARTH_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = var("HEARTH_API_PORT") {
            match port.parse() {
                Ok(p) => self.api.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid HEARTH_API_PORT"),
            }
        }

        if let Some(level) = var("HEARTH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("HEARTH_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Open the pattern store and wire an engine over the configured sources
    pub fn build_engine(&self) -> Result<AnalysisEngine, ConfigError> {
        let db_path = Path::new(&self.store.path);
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                error: e.to_string(),
            })?;
        }
        let store = Arc::new(SqlitePatternStore::open(db_path)?);

        let offset = FixedOffset::east_opt(self.events.utc_offset_minutes * 60).unwrap_or_else(|| {
            tracing::warn!(
                utc_offset_minutes = self.events.utc_offset_minutes,
                "Offset out of range, using UTC"
            );
            Utc.fix()
        });
        let mut source = CsvEventSource::new(&self.events.csv_path).with_offset(offset);
        if let Some(path) = &self.events.automations_csv_path {
            source = source.with_automations(path);
        }

        let settings = FileSettingsProvider::new(&self.analysis.settings_path);

        Ok(AnalysisEngine::new(Arc::new(source), Arc::new(settings), store))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Failed to open pattern store: {0}")]
    Store(#[from] StoreError),
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level. Output goes to stderr so the
/// one-shot binary can print diagnostics on stdout.
pub fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hearth={},tower_http=info", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);

    if logging.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Hearth Configuration
#
# Environment variables override these settings:
# - HEARTH_DB_PATH
# - HEARTH_EVENTS_CSV
# - HEARTH_AUTOMATIONS_CSV
# - HEARTH_SETTINGS
# - HEARTH_API_HOST
# - HEARTH_API_PORT
# - HEARTH_LOG_LEVEL
# - HEARTH_LOG_FORMAT

[store]
# SQLite database holding learned patterns
path = "~/.local/share/hearth/patterns.db"

[events]
# Recorder CSV export: timestamp,entity_id,old_state,new_state,room_id,...
csv_path = "./events.csv"

# Automation firings CSV, used to suppress echoes of existing automations
# automations_csv_path = "./automations.csv"

# Local offset for time slots and weekday/weekend (minutes east of UTC)
utc_offset_minutes = 0

[analysis]
# Exclusions, domain flags and tunables; re-read before every run
settings_path = "./settings.toml"

[api]
# API server host
host = "0.0.0.0"

# API server port
port = 8086

# Request timeout in seconds
request_timeout_secs = 30

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
