//! Settings for starport
//!
//! Handles loading of `starport.toml`. Every service value may also come
//! from an environment variable, read each time the value is used.

use crate::config_store::ConfigStore;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors loading the settings file
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to render settings: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub email: EmailSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub charm: CharmSettings,
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Mail service settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmailSettings {
    pub resend_api_key: Option<String>,
    pub sender_domain: Option<String>,
    /// Override of the Resend API base URL
    pub endpoint_url: Option<String>,
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmSettings {
    /// `openai` or `azure`
    pub provider: Option<String>,
    pub endpoint_url: Option<String>,
    pub api_key: Option<String>,
    pub gpt_model: Option<String>,
    pub dalle_model: Option<String>,
}

/// Charm account and storage settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CharmSettings {
    pub host: Option<String>,
    pub data_dir: Option<String>,
    pub key_file: Option<String>,
    pub ssh_port: Option<u16>,
    pub http_port: Option<u16>,
}

const MASK: &str = "********";

fn mask(value: &mut Option<String>) {
    if value.as_deref().is_some_and(|v| !v.is_empty()) {
        *value = Some(MASK.to_string());
    }
}

impl Settings {
    /// Default settings path: `<config_dir>/starport/starport.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("starport").join("starport.toml"))
    }

    /// Load from `path`, or from the default location when `None`. A missing
    /// default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text.trim_start_matches('\u{FEFF}'))
    }

    /// Copy with secrets replaced, for display
    #[must_use]
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        mask(&mut out.email.resend_api_key);
        mask(&mut out.llm.api_key);
        out
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Bind `key` to the configured value, falling back to the environment
/// variable `env` at read time. Blank configured values defer to the
/// environment.
pub fn bind_with_env(store: &ConfigStore<String>, key: &str, configured: Option<String>, env: &'static str) {
    let configured = configured.filter(|v| !v.trim().is_empty());
    store.set(key, move || {
        configured
            .clone()
            .or_else(|| std::env::var(env).ok())
            .unwrap_or_default()
    });
}
