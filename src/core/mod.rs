/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core runtime pieces: command line, logging, request context and errors

use crate::config::types::LogConfig;
use crate::core::log::EventFormatter;
use crate::core::runtime::{Options, Runtime};
use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub mod context;
pub mod dns_utils;
pub mod error;
mod log;
pub mod runtime;

/// Parse the command line into a fresh runtime container
pub fn init() -> Runtime {
    Runtime {
        options: Options::parse(),
        log_guard: None,
    }
}

/// Install the global tracing subscriber
///
/// Console output is always enabled. When `log.file` is set, events are also
/// written to that file through a non-blocking appender. The returned guard
/// must be kept alive so buffered lines are flushed on shutdown.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    let file_appender = log.file.as_deref().and_then(|file_path| {
        let path = Path::new(file_path);
        let file_name = path.file_name()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Some(tracing_appender::rolling::never(dir, file_name))
    });

    let (file_writer, guard) = match file_appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), guard)
        }
        // Without a file we still hand back a guard so callers hold one type
        None => (None, tracing_appender::non_blocking(std::io::sink()).1),
    };

    let console_layer = fmt::layer()
        .event_format(EventFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(EventFormatter)
            .with_ansi(false)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}
