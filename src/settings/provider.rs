//! Settings Providers
//!
//! The orchestrator calls `SettingsProvider::load` once at the start of
//! every pass, so edits made between passes always take effect.

use crate::settings::error::{SettingsError, SettingsResult};
use crate::settings::AnalysisSettings;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Source of the current exclusions, domain flags and tunables
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn load(&self) -> SettingsResult<AnalysisSettings>;
}

/// Settings held in memory and replaced by the embedding application
#[derive(Default)]
pub struct StaticSettings {
    settings: RwLock<AnalysisSettings>,
}

impl StaticSettings {
    pub fn new(settings: AnalysisSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Replace the settings used by subsequent passes
    pub async fn update(&self, settings: AnalysisSettings) {
        *self.settings.write().await = settings;
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn load(&self) -> SettingsResult<AnalysisSettings> {
        Ok(self.settings.read().await.clone())
    }
}

/// Settings read from a TOML file on every load
///
/// A missing file means "no exclusions, default tunables".
pub struct FileSettingsProvider {
    path: PathBuf,
}

impl FileSettingsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsProvider for FileSettingsProvider {
    async fn load(&self) -> SettingsResult<AnalysisSettings> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?self.path, "No settings file, using defaults");
                return Ok(AnalysisSettings::default());
            }
            Err(e) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    error: e.to_string(),
                })
            }
        };

        AnalysisSettings::from_toml_str(&content)
    }
}
