pub mod schema;

pub use schema::{Config, LocationConfig, VoiceSettings};

use std::path::{Path, PathBuf};

/// Environment variable that overrides `voice.api_key`.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// `~/.safetravel/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let home = directories::UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".safetravel").join("config.toml"))
}

impl Config {
    /// Load from `path` (or the default location), apply env overrides.
    ///
    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
            Self::from_toml(&contents)?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.apply_env_overrides(std::env::var(API_KEY_ENV).ok());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))
    }

    fn apply_env_overrides(&mut self, api_key: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.voice.api_key = Some(key.trim().to_string());
        }
    }
}
