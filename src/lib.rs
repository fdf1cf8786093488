#[macro_use]
extern crate log;

use std::sync::Arc;

use anyhow::Context;

use crate::config::ProxyConfig;
use crate::tunnel::server::ProxyServer;
use crate::wake::UdpWakeSender;

pub mod config;
pub mod error;
pub mod events;
pub mod transport;
pub mod tunnel;
pub mod wake;

/// Starts the proxy, waking the target with UDP magic packets, and serves until the listener
/// fails.
pub async fn start_proxy(config: ProxyConfig) -> anyhow::Result<()> {
    let wake_sender = Arc::new(UdpWakeSender::new(config.wake_addr));
    let server = ProxyServer::bind(config, wake_sender)
        .await
        .context("Failed to start proxy server")?;
    server.serve().await
}
