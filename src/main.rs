/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! squic-dns - a DNS relay for DNS over QUIC and SCION
//!
//! Entry point of the server:
//! - DoQ listeners on UDP and on SCION end-host sockets
//! - Upstream forwarding over pooled UDP, TCP and DoT connections
//! - Graceful shutdown on Ctrl+C

use tokio::sync::oneshot;
use tokio::{runtime, signal};
use tracing::{error, info};

mod config;
mod core;
mod network;
mod plugin;

use crate::core::error::{DnsError, Result};

fn main() -> Result<()> {
    init_runtime()
}

/// Build the multi-threaded Tokio runtime and run the server on it
fn init_runtime() -> Result<()> {
    let tokio_runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("squic-dns-worker")
        .build()
        .map_err(|err| DnsError::runtime(format!("Failed to initialize Tokio runtime: {err}")))?;
    tokio_runtime.block_on(run_async_main())
}

/// Load configuration, start plugins and wait for Ctrl+C
async fn run_async_main() -> Result<()> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    let mut runtime = core::init();
    let options = runtime.options.clone();

    let config = match config::init(&options.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!(
                "Configuration initialization failed ({}): {}",
                options.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    // Command line wins over the config file
    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }

    // Keep the guard so buffered log lines are flushed on exit
    runtime.log_guard = Some(core::init_log(log_config));
    info!(
        "squic-dns {} initializing (config: {:?})",
        env!("CARGO_PKG_VERSION"),
        options.config
    );

    let registry = match plugin::init(config).await {
        Ok(registry) => {
            info!("squic-dns server started successfully");
            registry
        }
        Err(e) => {
            error!("Plugin initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    shutdown_rx.await.ok();
    info!("Destroying plugins for shutdown");
    registry.destroy_plugins().await;
    info!("Graceful shutdown complete");
    Ok(())
}
