//! Subsystem configuration loaded from TOML or the environment

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::aset::AllocSetSizes;
use crate::error::ConfigError;
use crate::logging::{parse_level, LogConfig};

/// Environment variable naming a TOML configuration file
pub const CONFIG_ENV: &str = "MEMCTX_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Sizing of the top-most context
    #[serde(default = "default_top")]
    pub top: AllocSetSizes,

    /// Sizing of the error context; `min_context_size` is the reserve kept
    /// for error reporting
    #[serde(default = "default_error")]
    pub error: AllocSetSizes,

    /// Sizing used by `AllocSet::create_default`
    #[serde(default)]
    pub defaults: AllocSetSizes,

    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub spans: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top: default_top(),
            error: default_error(),
            defaults: AllocSetSizes::DEFAULT,
            log: LogSection::default(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
            spans: false,
        }
    }
}

fn default_top() -> AllocSetSizes {
    AllocSetSizes::TOP
}

fn default_error() -> AllocSetSizes {
    AllocSetSizes::ERROR
}

fn default_level() -> String {
    "info".to_string()
}

impl MemoryConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load the file named by `MEMCTX_CONFIG`, falling back to defaults
    pub fn from_env() -> Self {
        let Ok(path) = std::env::var(CONFIG_ENV) else {
            return Self::default();
        };

        match Self::load(Path::new(&path)) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    event = "config_fallback",
                    path = %path,
                    error = %err,
                    "Falling back to default memory configuration"
                );
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, sizes) in [("top", &self.top), ("error", &self.error), ("defaults", &self.defaults)] {
            sizes
                .validate()
                .map_err(|msg| ConfigError::Invalid(format!("[{}] {}", section, msg)))?;
        }

        if self.error.min_context_size == 0 {
            return Err(ConfigError::Invalid(
                "[error] min_context_size must reserve memory for error reporting".to_string(),
            ));
        }

        Ok(())
    }

    /// Logging settings of this configuration
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: parse_level(&self.log.level),
            file_output: self.log.file.is_some(),
            log_path: self.log.file.clone(),
            json_format: self.log.json,
            show_spans: self.log.spans,
        }
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;

        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}
