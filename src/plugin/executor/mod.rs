/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */
use crate::core::context::DnsContext;
use crate::core::error::Result;
use crate::plugin::Plugin;
use async_trait::async_trait;

pub mod forward;

#[async_trait]
pub trait Executor: Plugin {
    /// Process the request in `context`, leaving any answer in
    /// `context.response`
    ///
    /// An error makes the request handler answer SERVFAIL.
    async fn execute(&self, context: &mut DnsContext) -> Result<()>;
}
