use std::fmt::{Display, Formatter};
use std::io;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::events::Event;
use crate::transport::BoxedStream;
use crate::tunnel::bridge::StreamBridge;
use crate::tunnel::connector::TargetConnector;

pub mod bridge;
pub mod connector;
pub mod server;

/// Client bytes held while the target is still being reached. Reading pauses once full.
const EARLY_DATA_LIMIT: usize = 64 * 1024;

/// Sequential identifier of an accepted client connection, used in logs.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionId(pub u32);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[#{}]", self.0)
    }
}

/// Drives one client connection: reach the target, then bridge the two streams.
///
/// Returning, for any reason, drops the client stream together with the target stream, any
/// in-flight connect attempt and the connector's timers.
pub async fn handle_connection(
    id: ConnectionId,
    mut client: BoxedStream,
    mut connector: TargetConnector,
) -> anyhow::Result<()> {
    let mut early_data = Vec::with_capacity(EARLY_DATA_LIMIT);

    let mut target = tokio::select! {
        result = connector.run() => result.with_context(|| "Failed to connect to target")?,
        result = hold_client(&mut client, &mut early_data) => {
            match result {
                Ok(()) => info!("{} Client left before the target was reachable", id),
                Err(e) => info!("{} Client failed before the target was reachable: {:?}", id, e),
            }
            return Ok(());
        }
    };

    if !early_data.is_empty() {
        debug!("{} Forwarding {} early bytes to target", id, early_data.len());
        target
            .write_all(&early_data)
            .await
            .with_context(|| "Failed to forward early client data to target")?;
    }

    let summary = StreamBridge::new(id, client, target).run().await;
    connector.handle_event(Event::Closed).await?;

    match summary.error {
        Some(e) => Err(e).with_context(|| format!("Relay ended by {}", summary.closed_by)),
        None => {
            info!("{} Connection closed by {}", id, summary.closed_by);
            Ok(())
        }
    }
}

/// Buffers what the client sends until the limit, and completes when the client goes away.
///
/// A client that half-closes after sending something has not gone away: its request is still
/// owed to the target.
async fn hold_client(client: &mut BoxedStream, early_data: &mut Vec<u8>) -> io::Result<()> {
    loop {
        if early_data.len() >= EARLY_DATA_LIMIT {
            return futures::future::pending().await;
        }
        if client.read_buf(early_data).await? == 0 {
            if early_data.is_empty() {
                return Ok(());
            }
            return futures::future::pending().await;
        }
    }
}
