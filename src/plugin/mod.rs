/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin system for squic-dns
//!
//! Two plugin kinds exist:
//! - Server plugins (QUIC and SCION-QUIC listeners)
//! - Executor plugins (upstream forwarding)
//!
//! Plugins are created by factories from config entries and initialized in
//! config order, so an executor must be listed before any server that names
//! it as `entry`.

use crate::config::types::{Config, PluginConfig};
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::Executor;
use crate::plugin::executor::forward::ForwardFactory;
use crate::plugin::server::Server;
use crate::plugin::server::quic::{QuicServerFactory, SquicServerFactory};
use async_trait::async_trait;
use serde_yml::Value;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use tracing::info;

pub mod executor;
pub mod registry;
pub mod server;

pub use registry::PluginRegistry;

/// Build the registry with every built-in factory and initialize the
/// configured plugins
///
/// # Arguments
/// * `config` - Loaded application configuration
///
/// # Returns
/// * `Ok(Arc<PluginRegistry>)` - Registry holding every initialized plugin
/// * `Err(DnsError)` - Validation or initialization of some plugin failed
pub async fn init(config: Config) -> Result<Arc<PluginRegistry>> {
    info!(
        "Starting plugin initialization ({} plugins)",
        config.plugins.len()
    );

    let mut registry = PluginRegistry::new();
    registry.register_factory("forward", Box::new(ForwardFactory {}));
    registry.register_factory("quic_server", Box::new(QuicServerFactory {}));
    registry.register_factory("squic_server", Box::new(SquicServerFactory {}));

    let registry = Arc::new(registry);
    registry.clone().init_plugins(config.plugins).await?;
    Ok(registry)
}

/// Plugin category
///
/// Determines how a plugin is used by the rest of the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginType {
    /// Processes DNS queries (e.g. forwarding upstream)
    Executor,
    /// Accepts client connections and feeds queries to an executor
    Server,
}

impl Display for PluginType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginType::Executor => write!(f, "Executor"),
            PluginType::Server => write!(f, "Server"),
        }
    }
}

/// Core plugin trait that all plugins must implement
#[async_trait]
pub trait Plugin: Debug + Send + Sync + 'static {
    /// Get the plugin's unique tag
    fn tag(&self) -> &str;

    /// Initialize the plugin (called once during startup, before it is shared)
    async fn init(&mut self) -> Result<()>;

    /// Clean up plugin resources (called during shutdown)
    async fn destroy(&self);
}

/// Plugin factory trait for creating plugin instances from configuration
pub trait PluginFactory: Debug + Send + Sync + 'static {
    /// Check the plugin arguments without creating anything
    ///
    /// Runs for every configured plugin before any plugin is created, so a
    /// bad entry late in the list fails startup before listeners bind.
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()>;

    /// Create an uninitialized plugin instance
    ///
    /// # Arguments
    /// * `plugin_config` - Plugin configuration from the config file
    /// * `registry` - Gives access to plugins initialized earlier
    ///
    /// # Returns
    /// * `Ok(UninitializedPlugin)` - Plugin ready for `init`
    /// * `Err(DnsError)` - Invalid arguments or a missing dependency
    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin>;
}

/// A freshly created plugin, still exclusively owned by the registry
#[derive(Debug)]
pub enum UninitializedPlugin {
    /// Executor plugin awaiting `init`
    Executor(Box<dyn Executor>),
    /// Server plugin awaiting `init`
    Server(Box<dyn Server>),
}

impl UninitializedPlugin {
    /// Run `init` and freeze the plugin behind an `Arc`
    pub async fn init_and_wrap(self) -> Result<PluginHolder> {
        match self {
            UninitializedPlugin::Executor(mut plugin) => {
                plugin.init().await?;
                Ok(PluginHolder::Executor(Arc::from(plugin)))
            }
            UninitializedPlugin::Server(mut plugin) => {
                plugin.init().await?;
                Ok(PluginHolder::Server(Arc::from(plugin)))
            }
        }
    }
}

/// Shared handle to an initialized plugin
#[derive(Debug, Clone)]
pub enum PluginHolder {
    Executor(Arc<dyn Executor>),
    Server(Arc<dyn Server>),
}

impl PluginHolder {
    /// Get the category of the wrapped plugin
    pub fn plugin_type(&self) -> PluginType {
        match self {
            PluginHolder::Executor(_) => PluginType::Executor,
            PluginHolder::Server(_) => PluginType::Server,
        }
    }

    /// Get the wrapped plugin's tag
    pub fn tag(&self) -> &str {
        match self {
            PluginHolder::Executor(plugin) => plugin.tag(),
            PluginHolder::Server(plugin) => plugin.tag(),
        }
    }

    /// Release the wrapped plugin's resources
    pub async fn destroy(&self) {
        match self {
            PluginHolder::Executor(plugin) => plugin.destroy().await,
            PluginHolder::Server(plugin) => plugin.destroy().await,
        }
    }
}

/// Plugin metadata and instance container
#[derive(Debug)]
pub struct PluginInfo {
    /// Plugin instance tag (unique identifier)
    pub tag: String,

    /// Category of the plugin
    pub plugin_type: PluginType,

    /// Plugin-specific configuration arguments
    pub args: Option<Value>,

    /// The initialized plugin instance
    pub plugin_holder: PluginHolder,
}

impl PluginInfo {
    /// The plugin as an executor, or an error naming what it actually is
    pub fn to_executor(&self) -> Result<Arc<dyn Executor>> {
        match &self.plugin_holder {
            PluginHolder::Executor(executor) => Ok(executor.clone()),
            other => Err(DnsError::plugin(format!(
                "plugin [{}] is a {}, not an executor",
                self.tag,
                other.plugin_type()
            ))),
        }
    }

    /// The plugin as a server, if it is one
    pub fn to_server(&self) -> Option<Arc<dyn Server>> {
        match &self.plugin_holder {
            PluginHolder::Server(server) => Some(server.clone()),
            PluginHolder::Executor(_) => None,
        }
    }
}
