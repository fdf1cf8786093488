use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::config::{ProxyConfig, TargetConfig};
use crate::transport::{Acceptor, TargetDialer, TcpDialer};
use crate::tunnel::connector::{ConnectorTiming, TargetConnector};
use crate::tunnel::{handle_connection, ConnectionId};
use crate::wake::{WakeSender, WakeTrigger};

/// Listens on the source endpoint and proxies every accepted client to the target.
pub struct ProxyServer {
    listener: TcpListener,
    acceptor: Acceptor,
    dialer: Arc<dyn TargetDialer>,
    /// One trigger for all connections: the target is woken once per cool-down.
    wake: Arc<WakeTrigger>,
    timing: ConnectorTiming,
    target: TargetConfig,
}

impl ProxyServer {
    /// Prepares TLS on both legs and binds the listening socket.
    pub async fn bind(config: ProxyConfig, wake_sender: Arc<dyn WakeSender>) -> anyhow::Result<Self> {
        let acceptor = Acceptor::new(config.source.tls.as_ref())
            .with_context(|| "Failed to configure TLS for incoming connections")?;
        let dialer = TcpDialer::new(&config.target, config.connect_timeout)
            .with_context(|| "Failed to configure connections to target")?;

        let bind_addr = config.source.bind_addr();
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to listen on {}", bind_addr))?;

        Ok(Self {
            listener,
            acceptor,
            dialer: Arc::new(dialer),
            wake: Arc::new(WakeTrigger::new(
                config.target.mac,
                config.wake_cooldown,
                wake_sender,
            )),
            timing: ConnectorTiming {
                grace_period: config.grace_period,
                retry_interval: config.retry_interval,
            },
            target: config.target,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .with_context(|| "Failed to read local address of proxy listener")
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self) -> anyhow::Result<()> {
        info!(
            "Proxying [{}]->[{}]{}",
            self.local_addr()?,
            self.target,
            if self.acceptor.is_tls() { " over TLS" } else { "" }
        );

        let mut next_id = 0u32;
        loop {
            let (socket, peer_addr) = self
                .listener
                .accept()
                .await
                .with_context(|| "Failed to accept connection on proxy server")?;

            let id = ConnectionId(next_id);
            next_id = next_id.wrapping_add(1);
            info!("{} Incoming connection from {}", id, peer_addr);

            if let Err(e) = socket.set_nodelay(true) {
                debug!("{} Failed to set TCP_NODELAY: {:?}", id, e);
            }

            let acceptor = self.acceptor.clone();
            let connector =
                TargetConnector::new(id, self.dialer.clone(), self.wake.clone(), self.timing);
            tokio::spawn(async move {
                let client = match acceptor.accept(socket).await {
                    Ok(client) => client,
                    Err(e) => {
                        warn!("{} TLS handshake with {} failed: {:?}", id, peer_addr, e);
                        return;
                    }
                };

                if let Err(e) = handle_connection(id, client, connector).await {
                    error!("{} Connection dropped un-gracefully: {:?}", id, e);
                }
            });
        }
    }
}
