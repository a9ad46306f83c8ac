//! Process settings.
//!
//! Layered with figment: built-in defaults, then an optional JSON file,
//! then environment variables:
//!
//! | Variable            | Field         |
//! |---------------------|---------------|
//! | `PILOT_ENV`         | `env`         |
//! | `PILOT_STORE_PATH`  | `store_path`  |
//! | `PILOT_PARALLELISM` | `engine.parallelism` |
//! | `PILOT_BIND`        | `bind`        |

use crate::engine::EngineConfig;
use crate::resume::ResumeConfig;
use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use pilot_plan::CompilerConfig;
use pilot_storage::StoreConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const ENV_PREFIX: &str = "PILOT_";
const ENV_KEYS: [&str; 4] = ["env", "store_path", "bind", "parallelism"];

/// Settings errors
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The named settings file does not exist
    #[error("settings file {path} not found")]
    Missing {
        /// File path
        path: PathBuf,
    },

    /// A layer holds a value that does not fit [`Settings`]
    #[error("invalid settings: {0}")]
    Figment(#[from] figment::Error),

    /// An environment override has an unusable value
    #[error("invalid value for {var}: {reason}")]
    InvalidOverride {
        /// Variable name
        var: String,
        /// What is wrong
        reason: String,
    },
}

/// Runtime settings shared by the server and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Deployment label, informational
    pub env: String,
    /// Durable store file; in-memory when absent
    pub store_path: Option<PathBuf>,
    /// HTTP bind address
    pub bind: String,
    /// Compiler configuration
    pub compiler: CompilerConfig,
    /// Engine configuration
    pub engine: EngineConfig,
    /// Resume configuration
    pub resume: ResumeConfig,
    /// Inbox served by the `mock_email` plugin
    pub mock_messages: Vec<Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            store_path: None,
            bind: "127.0.0.1:8080".to_string(),
            compiler: CompilerConfig::default(),
            engine: EngineConfig::default(),
            resume: ResumeConfig::default(),
            mock_messages: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from `path` (defaults when `None`), then apply the process
    /// environment
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or malformed, or a layer holds
    /// an unusable value
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        Self::from_figment(Self::figment(path)?)
    }

    /// The layered sources behind [`Settings::load`]
    ///
    /// # Errors
    ///
    /// Returns error if `path` names a file that does not exist
    pub fn figment(path: Option<&Path>) -> Result<Figment, SettingsError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(SettingsError::Missing {
                    path: path.to_path_buf(),
                });
            }
            debug!(path = %path.display(), "loading settings file");
            figment = figment.merge(Json::file(path));
        }
        Ok(figment.merge(env_overrides()))
    }

    /// Extract and validate settings from any figment
    ///
    /// # Errors
    ///
    /// Returns error if extraction fails or `engine.parallelism` is zero
    pub fn from_figment(figment: Figment) -> Result<Self, SettingsError> {
        let mut settings: Settings = figment.extract()?;
        if settings.engine.parallelism == 0 {
            return Err(SettingsError::InvalidOverride {
                var: "PILOT_PARALLELISM".to_string(),
                reason: "expected a positive integer, got 0".to_string(),
            });
        }
        if settings.store_path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            settings.store_path = None;
        }
        debug!(env = %settings.env, parallelism = settings.engine.parallelism, "settings loaded");
        Ok(settings)
    }

    /// Store configuration derived from `store_path`
    #[must_use]
    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            path: self.store_path.clone(),
        }
    }
}

/// `PILOT_*` variables; `PILOT_PARALLELISM` lands in `engine`
fn env_overrides() -> Env {
    Env::prefixed(ENV_PREFIX).only(&ENV_KEYS).map(|key| {
        if key == "parallelism" {
            "engine.parallelism".into()
        } else {
            key.into()
        }
    })
}
