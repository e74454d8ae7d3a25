/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration module
//!
//! Handles loading and parsing of YAML configuration files.
//! Defines the structure for server configuration including:
//! - Logging settings
//! - Plugin configurations (forwarders and QUIC listeners)

use crate::config::types::Config;
use crate::core::error::Result;
use std::fs;
use std::path::Path;

pub mod types;

/// Load and parse configuration from YAML file
///
/// # Errors
/// Returns an error if the file cannot be read, if YAML parsing fails, or if validation fails.
pub fn init(file: &Path) -> Result<Config> {
    let string = fs::read_to_string(file)?;
    let config = parse(&string)?;

    // Logging is not up yet at this point
    eprintln!(
        "Configuration loaded and validated: {} plugin(s) configured",
        config.plugins.len()
    );
    Ok(config)
}

/// Parse and validate configuration text
pub fn parse(text: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::DnsError;

    #[test]
    fn test_parse_maps_validation_to_config_error() {
        let err = parse("log: { level: nope }\nplugins: []").unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[test]
    fn test_parse_maps_yaml_error() {
        let err = parse("plugins: [").unwrap_err();
        assert!(matches!(err, DnsError::Yaml(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = init(Path::new("/nonexistent/squic-dns.yaml")).unwrap_err();
        assert!(matches!(err, DnsError::Io(_)));
    }
}
