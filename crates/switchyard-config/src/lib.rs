//! Multi-tier TOML configuration for Switchyard.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > project file > global file > defaults

mod error;

pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use switchyard_mux::{ChildSpec, GatewaySettings};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SWITCHYARD_CONFIG";

/// Environment variable overriding the call timeout.
pub const CALL_TIMEOUT_ENV: &str = "SWITCHYARD_CALL_TIMEOUT_MS";

/// Environment variable overriding the global config directory.
pub const CONFIG_DIR_ENV: &str = "SWITCHYARD_CONFIG_DIR";

/// File name looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = "switchyard.toml";

/// Resolved configuration for a gateway run.
#[derive(Debug, Clone, Default)]
pub struct SwitchyardConfig {
    pub settings: GatewaySettings,
    pub children: Vec<ChildSpec>,
    /// File the configuration was read from, if any.
    pub source: Option<PathBuf>,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub call_timeout_ms: Option<u64>,
}

impl SwitchyardConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. Project config (./switchyard.toml)
    /// 4. Global config (~/.switchyard/config.toml)
    /// 5. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_from(overrides, &working_dir, &config_dir(), |key| {
            std::env::var(key).ok()
        })
    }

    /// Same as [`SwitchyardConfig::load`] with the working directory, global
    /// config directory and environment supplied by the caller.
    pub fn load_from(
        overrides: CliOverrides,
        working_dir: &Path,
        config_dir: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Resolve config file: CLI > env > project > global
        let explicit = overrides
            .config_path
            .or_else(|| env(CONFIG_ENV).filter(|p| !p.is_empty()).map(PathBuf::from));

        let (file, source) = match explicit {
            Some(path) => {
                let path = if path.is_relative() {
                    working_dir.join(path)
                } else {
                    path
                };
                (load_settings_file(&path)?, Some(path))
            }
            None => {
                let candidates = [
                    working_dir.join(PROJECT_CONFIG_FILE),
                    config_dir.join("config.toml"),
                ];
                match candidates.into_iter().find(|p| p.is_file()) {
                    Some(path) => (load_settings_file(&path)?, Some(path)),
                    None => {
                        tracing::warn!(
                            "No config file found (tried ./{PROJECT_CONFIG_FILE} and {}); starting with no children",
                            config_dir.join("config.toml").display()
                        );
                        (SettingsFile::default(), None)
                    }
                }
            }
        };

        let mut settings = file.gateway;

        // Resolve call timeout: CLI > env > config file
        if let Some(ms) = overrides.call_timeout_ms {
            settings.call_timeout_ms = ms;
        } else if let Some(raw) = env(CALL_TIMEOUT_ENV) {
            settings.call_timeout_ms = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: CALL_TIMEOUT_ENV.into(),
                message: format!("'{raw}' is not a number of milliseconds: {e}"),
            })?;
        }

        let base_dir = source
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| working_dir.to_path_buf());
        let children = file
            .children
            .into_iter()
            .map(|mut spec| {
                if let Some(cwd) = spec.cwd.take() {
                    spec.cwd = Some(if cwd.is_relative() {
                        base_dir.join(cwd)
                    } else {
                        cwd
                    });
                }
                spec
            })
            .collect();

        let config = SwitchyardConfig {
            settings,
            children,
            source,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and child naming rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("gateway.call_timeout_ms", self.settings.call_timeout_ms),
            ("gateway.handshake_timeout_ms", self.settings.handshake_timeout_ms),
            ("gateway.max_in_flight", self.settings.max_in_flight as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        let mut seen = HashSet::new();
        for (i, child) in self.children.iter().enumerate() {
            let key = format!("children[{i}].name");
            if child.name.is_empty() {
                return Err(invalid(&key, "must not be empty"));
            }
            if child.name.chars().any(char::is_whitespace) {
                return Err(invalid(
                    &key,
                    &format!("'{}' must not contain whitespace", child.name),
                ));
            }
            if !seen.insert(child.name.as_str()) {
                return Err(invalid(&key, &format!("duplicate child '{}'", child.name)));
            }
            if child.command.trim().is_empty() {
                return Err(invalid(
                    &format!("children[{i}].command"),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Get the Switchyard config directory path (~/.switchyard/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}

/// Load and parse a TOML settings file.
pub fn load_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
