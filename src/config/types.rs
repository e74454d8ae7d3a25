/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Defines the schema for squic-dns configuration files (YAML format).

use serde::Deserialize;
use serde_yml::Value;
use std::collections::HashSet;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Plugin tag cannot be empty")]
    EmptyPluginTag,

    #[error("Duplicate plugin tag: {0}")]
    DuplicatePluginTag(String),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Plugin type cannot be empty")]
    EmptyPluginType,
}

/// Main server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// Plugins in initialization order. Executors must be declared
    /// before the servers that use them as entry.
    pub plugins: Vec<PluginConfig>,
}

impl Config {
    /// Validate configuration
    ///
    /// Validates the configuration structure (log level, plugin tags/types).
    /// Plugin-specific validation (listen addresses, upstream, TLS material) is
    /// delegated to each PluginFactory during plugin initialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.tag.is_empty() {
                return Err(ConfigError::EmptyPluginTag);
            }
            if plugin.plugin_type.is_empty() {
                return Err(ConfigError::EmptyPluginType);
            }
            if !seen.insert(plugin.tag.as_str()) {
                return Err(ConfigError::DuplicatePluginTag(plugin.tag.clone()));
            }
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

/// Default log level
fn default_level() -> String {
    "info".to_string()
}

/// Plugin configuration entry
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Unique identifier for this plugin instance
    pub tag: String,

    /// Plugin type (e.g., "quic_server", "forward")
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Plugin-specific arguments (parsed by plugin factory)
    pub args: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse("plugins: []");
        assert_eq!(config.log.level, "info");
        assert!(config.log.file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_plugin_args_kept_raw() {
        let config = parse(
            r#"
log:
  level: debug
plugins:
  - tag: up
    type: forward
    args:
      upstream:
        addr: "tls://1.1.1.1:853"
"#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.plugins[0].plugin_type, "forward");
        assert!(config.plugins[0].args.is_some());
    }

    #[test]
    fn test_invalid_log_level() {
        let config = parse("log: { level: loud }\nplugins: []");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let config = parse(
            r#"
plugins:
  - { tag: a, type: forward }
  - { tag: a, type: quic_server }
"#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePluginTag(tag)) if tag == "a"
        ));
    }

    #[test]
    fn test_empty_type_rejected() {
        let config = parse("plugins:\n  - { tag: a, type: '' }");
        assert!(matches!(config.validate(), Err(ConfigError::EmptyPluginType)));
    }
}
