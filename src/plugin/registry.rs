/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin registry for managing plugin factories and instances

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::plugin::{PluginFactory, PluginInfo};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Plugin registry that manages plugin factories and instances
#[derive(Debug)]
pub struct PluginRegistry {
    /// Map of plugin type names to their factory implementations
    factories: HashMap<String, Box<dyn PluginFactory>>,

    /// Map of plugin tags to their runtime instances
    ///
    /// Uses DashMap for interior mutability, allowing plugins to be registered
    /// even when the registry is behind an Arc.
    plugins: DashMap<String, Arc<PluginInfo>>,

    /// Initialization order of plugins (for deterministic shutdown)
    init_order: Mutex<Vec<String>>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            plugins: DashMap::new(),
            init_order: Mutex::new(Vec::new()),
        }
    }

    /// Register a plugin factory
    ///
    /// # Arguments
    /// * `plugin_type` - The config `type` name for this plugin (e.g., "forward", "quic_server")
    /// * `factory` - The factory implementation for creating plugin instances
    pub fn register_factory(&mut self, plugin_type: &str, factory: Box<dyn PluginFactory>) {
        self.factories.insert(plugin_type.to_string(), factory);
    }

    /// Look up the factory for a config entry's `type`
    fn factory(&self, config: &PluginConfig) -> Result<&dyn PluginFactory> {
        self.factories
            .get(&config.plugin_type)
            .map(|f| f.as_ref())
            .ok_or_else(|| DnsError::plugin(format!("Unknown plugin type: {}", config.plugin_type)))
    }

    /// Initialize all plugins from configuration
    ///
    /// Every config is validated first; plugins are then created and
    /// initialized in the order they are listed.
    ///
    /// # Arguments
    /// * `self` - Arc-wrapped registry to allow sharing with plugins
    /// * `configs` - Vector of plugin configurations
    ///
    /// # Returns
    /// * `Ok(())` - All plugins initialized successfully
    /// * `Err(DnsError)` - The first validation, creation or init failure
    pub(crate) async fn init_plugins(self: Arc<Self>, configs: Vec<PluginConfig>) -> Result<()> {
        info!("Validating plugin configurations...");
        for config in &configs {
            self.factory(config)?.validate_config(config)?;
        }

        let total = configs.len();
        for (idx, plugin_config) in configs.iter().enumerate() {
            info!(
                "  [{}/{}] Initializing plugin: {} (type: {})",
                idx + 1,
                total,
                plugin_config.tag,
                plugin_config.plugin_type
            );
            debug!("Plugin config: {:?}", plugin_config);

            let uninitialized = self.factory(plugin_config)?.create(plugin_config, self.clone())?;
            let plugin_holder = uninitialized.init_and_wrap().await?;

            self.plugins.insert(
                plugin_config.tag.clone(),
                Arc::new(PluginInfo {
                    tag: plugin_config.tag.clone(),
                    plugin_type: plugin_holder.plugin_type(),
                    args: plugin_config.args.clone(),
                    plugin_holder,
                }),
            );
            if let Ok(mut order) = self.init_order.lock() {
                order.push(plugin_config.tag.clone());
            }
        }

        info!("All plugins initialized successfully");
        Ok(())
    }

    /// Get a plugin instance by tag
    ///
    /// Returns `None` if no plugin with this tag has been initialized yet.
    pub fn get_plugin(&self, tag: &str) -> Option<Arc<PluginInfo>> {
        self.plugins.get(tag).map(|entry| entry.clone())
    }

    /// Get all registered plugin tags
    pub fn plugin_tags(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get the number of initialized plugins
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Destroy all initialized plugins in reverse init order
    ///
    /// Servers are listed after the executors they use, so they stop
    /// accepting queries before their executors go away. Calling this twice
    /// is a no-op the second time.
    pub async fn destroy_plugins(&self) {
        let order = self
            .init_order
            .lock()
            .map(|mut order| std::mem::take(&mut *order))
            .unwrap_or_default();

        if order.is_empty() {
            return;
        }

        info!("Destroying {} plugins in reverse order", order.len());

        for tag in order.into_iter().rev() {
            if let Some((_, info)) = self.plugins.remove(&tag) {
                debug!("Destroying plugin: {}", tag);
                info.plugin_holder.destroy().await;
            }
        }

        info!("All plugins destroyed");
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
