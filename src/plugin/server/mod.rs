/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */
use crate::core::context::DnsContext;
use crate::core::dns_utils::build_response_from_request;
use crate::core::error::Result;
use crate::network::upstream::Protocol;
use crate::plugin::Plugin;
use crate::plugin::executor::Executor;
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{Level, debug, event_enabled, warn};

pub mod packet_conn;
pub mod quic;

pub trait Server: Plugin {
    /// Address actually bound, once the listener is up
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Sink for the answer to one exchange
pub trait ResponseWriter: Send {
    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Transport family the client used
    fn protocol(&self) -> Protocol;

    fn write_msg(&mut self, msg: Message) -> Result<()>;
}

/// DNS-chain entrypoint a listener hands each decoded request to
#[async_trait]
pub trait ServeDns: Debug + Send + Sync {
    async fn serve_dns(&self, writer: &mut dyn ResponseWriter, request: Message);
}

/// Writer that keeps the response for the listener to inspect afterwards
#[derive(Debug)]
pub struct CapturingWriter {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    protocol: Protocol,
    msg: Option<Message>,
}

impl CapturingWriter {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            local_addr,
            remote_addr,
            protocol,
            msg: None,
        }
    }

    /// The captured response, if anything was written
    pub fn take(&mut self) -> Option<Message> {
        self.msg.take()
    }
}

impl ResponseWriter for CapturingWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn write_msg(&mut self, msg: Message) -> Result<()> {
        self.msg = Some(msg);
        Ok(())
    }
}

/// Runs the entry executor for each request
#[derive(Debug)]
pub struct RequestHandle {
    pub entry_executor: Arc<dyn Executor>,
}

#[async_trait]
impl ServeDns for RequestHandle {
    async fn serve_dns(&self, writer: &mut dyn ResponseWriter, request: Message) {
        let src_addr = writer.remote_addr();
        let mut context =
            DnsContext::new(src_addr, writer.local_addr(), writer.protocol(), request);

        // Log request details only when debug logging is enabled
        if event_enabled!(Level::DEBUG) {
            debug!(
                "DNS request from {}, queries: {:?}, edns: {:?}",
                &src_addr,
                context.request.queries(),
                context.request.extensions()
            );
        }

        let response = match self.entry_executor.execute(&mut context).await {
            Ok(()) => context.response.take(),
            Err(e) => {
                warn!(
                    "Entry executor '{}' failed for source {} id {}: {}",
                    self.entry_executor.tag(),
                    src_addr,
                    context.request.id(),
                    e
                );
                Some(build_response_from_request(
                    &context.request,
                    ResponseCode::ServFail,
                ))
            }
        };

        let Some(response) = response else {
            debug!("No response for {} id {}", src_addr, context.request.id());
            return;
        };

        if event_enabled!(Level::DEBUG) {
            debug!(
                "Sending response to {}, id: {}, rcode: {}, answers: {}",
                &src_addr,
                response.id(),
                response.response_code(),
                response.answers().len()
            );
        }

        if let Err(e) = writer.write_msg(response) {
            warn!("Failed to write response to {}: {}", src_addr, e);
        }
    }
}
