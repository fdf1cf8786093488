use std::fmt::{Display, Formatter};
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::transport::BoxedStream;
use crate::tunnel::ConnectionId;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Side {
    Client,
    Target,
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Target => write!(f, "target"),
        }
    }
}

/// Outcome of a bridge, for logging.
#[derive(Debug)]
pub struct BridgeSummary {
    /// The side whose stream ended first.
    pub closed_by: Side,
    /// The error that ended it, if it did not close cleanly.
    pub error: Option<io::Error>,
}

/// Full-duplex relay between the client and the target.
///
/// There is no half-open state: as soon as either direction ends, both streams are dropped.
pub struct StreamBridge {
    id: ConnectionId,
    client: BoxedStream,
    target: BoxedStream,
}

impl StreamBridge {
    pub fn new(id: ConnectionId, client: BoxedStream, target: BoxedStream) -> Self {
        Self { id, client, target }
    }

    pub async fn run(self) -> BridgeSummary {
        let id = self.id;
        let (mut client_rx, mut client_tx) = tokio::io::split(self.client);
        let (mut target_rx, mut target_tx) = tokio::io::split(self.target);

        // Both halves of both streams go out of scope on return, closing the sockets together.
        tokio::select! {
            result = relay(&mut client_rx, &mut target_tx) => {
                summarize(id, Side::Client, "client to target", result)
            }
            result = relay(&mut target_rx, &mut client_tx) => {
                summarize(id, Side::Target, "target to client", result)
            }
        }
    }
}

async fn relay<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(reader, writer).await?;
    writer.flush().await?;
    Ok(copied)
}

fn summarize(
    id: ConnectionId,
    side: Side,
    direction: &str,
    result: io::Result<u64>,
) -> BridgeSummary {
    match result {
        Ok(bytes) => {
            debug!("{} Relayed {} bytes {} before {} closed", id, bytes, direction, side);
            BridgeSummary {
                closed_by: side,
                error: None,
            }
        }
        Err(e) => {
            debug!("{} Relay {} failed: {:?}", id, direction, e);
            BridgeSummary {
                closed_by: side,
                error: Some(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair() -> (DuplexStream, DuplexStream, DuplexStream, DuplexStream) {
        let (client_far, client_near) = tokio::io::duplex(64);
        let (target_near, target_far) = tokio::io::duplex(64);
        (client_far, client_near, target_near, target_far)
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut client, client_near, target_near, mut target) = pair();
        let bridge = StreamBridge::new(
            ConnectionId(1),
            Box::new(client_near),
            Box::new(target_near),
        );
        let handle = tokio::spawn(bridge.run());

        // Larger than the duplex buffers, so the copy loops must interleave.
        let payload: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; expected.len()];
            target.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
            target.write_all(b"reply").await.unwrap();
            target
        });
        client.write_all(&payload).await.unwrap();
        let _target = reader.await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(client);
        let summary = handle.await.unwrap();
        assert_eq!(summary.closed_by, Side::Client);
        assert!(summary.error.is_none());
    }

    #[tokio::test]
    async fn test_client_close_tears_down_target() {
        let (client, client_near, target_near, mut target) = pair();
        let bridge = StreamBridge::new(
            ConnectionId(2),
            Box::new(client_near),
            Box::new(target_near),
        );
        let handle = tokio::spawn(bridge.run());

        drop(client);
        let summary = handle.await.unwrap();
        assert_eq!(summary.closed_by, Side::Client);

        // The target's end observes EOF: its counterpart was dropped.
        let mut buf = Vec::new();
        assert_eq!(target.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_target_close_tears_down_client() {
        let (mut client, client_near, target_near, target) = pair();
        let bridge = StreamBridge::new(
            ConnectionId(3),
            Box::new(client_near),
            Box::new(target_near),
        );
        let handle = tokio::spawn(bridge.run());

        drop(target);
        let summary = handle.await.unwrap();
        assert_eq!(summary.closed_by, Side::Target);

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
