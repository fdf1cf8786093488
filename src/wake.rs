use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::MacAddress;

const SYNC_STREAM: [u8; 6] = [0xff; 6];
const MAC_REPETITIONS: usize = 16;
pub const MAGIC_PACKET_LEN: usize = SYNC_STREAM.len() + MAC_REPETITIONS * 6;

/// Wake-on-LAN payload: six `0xff` bytes followed by the hardware address repeated 16 times.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MagicPacket([u8; MAGIC_PACKET_LEN]);

impl MagicPacket {
    pub fn new(mac: MacAddress) -> Self {
        let mut packet = [0u8; MAGIC_PACKET_LEN];
        packet[..SYNC_STREAM.len()].copy_from_slice(&SYNC_STREAM);
        packet[SYNC_STREAM.len()..]
            .chunks_exact_mut(6)
            .for_each(|chunk| chunk.copy_from_slice(&mac.octets()));
        Self(packet)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Capability to broadcast a wake request to a hardware address.
#[async_trait]
pub trait WakeSender: Send + Sync {
    async fn send(&self, mac: MacAddress) -> anyhow::Result<()>;
}

/// Sends magic packets over UDP, by default as a limited broadcast on port 9.
#[derive(Clone, Debug)]
pub struct UdpWakeSender {
    addr: SocketAddr,
}

impl UdpWakeSender {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl WakeSender for UdpWakeSender {
    async fn send(&self, mac: MacAddress) -> anyhow::Result<()> {
        let bind_addr = match self.addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| "Failed to bind UDP socket for magic packet")?;
        socket
            .set_broadcast(true)
            .with_context(|| "Failed to enable broadcast on magic packet socket")?;

        let packet = MagicPacket::new(mac);
        let sent = socket
            .send_to(packet.as_bytes(), self.addr)
            .await
            .with_context(|| format!("Failed to send magic packet to {}", self.addr))?;
        if sent != MAGIC_PACKET_LEN {
            anyhow::bail!(
                "Magic packet truncated: sent {} of {} bytes",
                sent,
                MAGIC_PACKET_LEN
            );
        }
        Ok(())
    }
}

/// Last successful transmission, on the monotonic clock.
#[derive(Debug, Default)]
struct WakeState {
    last_sent: Option<Instant>,
}

impl WakeState {
    fn is_active(&self, cooldown: Duration) -> bool {
        self.last_sent
            .map(|sent| sent.elapsed() < cooldown)
            .unwrap_or(false)
    }
}

/// Sends at most one wake request per cool-down window for a single target.
///
/// Shared between every connection proxied to the same target, so that any number of
/// clients waiting on a sleeping machine produce a single magic packet.
pub struct WakeTrigger {
    mac: MacAddress,
    cooldown: Duration,
    sender: Arc<dyn WakeSender>,
    state: Mutex<WakeState>,
}

impl WakeTrigger {
    pub fn new(mac: MacAddress, cooldown: Duration, sender: Arc<dyn WakeSender>) -> Self {
        Self {
            mac,
            cooldown,
            sender,
            state: Mutex::new(WakeState::default()),
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Whether a wake was sent within the cool-down window.
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_active(self.cooldown)
    }

    /// Returns whether a packet was actually transmitted.
    ///
    /// The state lock is held across the transmission: a concurrent caller waits and then
    /// observes the window as active.
    pub async fn send_if_needed(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.is_active(self.cooldown) {
            trace!("Wake for {} suppressed, cool-down still active", self.mac);
            return false;
        }

        debug!("Sending magic packet to {}", self.mac);
        match self.sender.send(self.mac).await {
            Ok(()) => {
                info!("Magic packet sent to {}", self.mac);
                state.last_sent = Some(Instant::now());
                true
            }
            Err(e) => {
                warn!("Unable to send magic packet to {}: {:?}", self.mac, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub const MAC: MacAddress = MacAddress::new([0x01, 0x23, 0x45, 0x67, 0x89, 0xab]);

    /// Counts transmissions; fails while `failing` is set.
    #[derive(Default)]
    pub struct CountingSender {
        pub sent: AtomicUsize,
        pub attempts: AtomicUsize,
        pub failing: AtomicBool,
    }

    impl CountingSender {
        pub fn failing() -> Self {
            let sender = Self::default();
            sender.failing.store(true, Ordering::SeqCst);
            sender
        }

        pub fn sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WakeSender for CountingSender {
        async fn send(&self, _mac: MacAddress) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            // Yield so that concurrent callers get a chance to race.
            tokio::task::yield_now().await;
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("network is down");
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn trigger(sender: Arc<CountingSender>, cooldown: Duration) -> WakeTrigger {
        WakeTrigger::new(MAC, cooldown, sender)
    }

    #[test]
    fn test_magic_packet_layout() {
        let packet = MagicPacket::new(MAC);
        let bytes = packet.as_bytes();
        assert_eq!(bytes.len(), 102);
        assert_eq!(&bytes[..6], &[0xff; 6]);
        for chunk in bytes[6..].chunks(6) {
            assert_eq!(chunk, &MAC.octets());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_marks_active_until_cooldown_elapses() {
        let sender = Arc::new(CountingSender::default());
        let trigger = trigger(sender.clone(), Duration::from_secs(60));

        assert!(!trigger.is_active().await);
        assert!(trigger.send_if_needed().await);
        assert!(trigger.is_active().await);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(trigger.is_active().await);
        assert!(!trigger.send_if_needed().await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!trigger.is_active().await);
        assert!(trigger.send_if_needed().await);
        assert_eq!(sender.sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_send_per_window() {
        let sender = Arc::new(CountingSender::default());
        let cooldown = Duration::from_secs(10);
        let trigger = trigger(sender.clone(), cooldown);

        let mut sent_at = Vec::new();
        let start = Instant::now();
        for _ in 0..100 {
            if trigger.send_if_needed().await {
                sent_at.push(start.elapsed());
            }
            tokio::time::advance(Duration::from_millis(700)).await;
        }

        assert!(sent_at.len() > 1);
        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= cooldown);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_leaves_state_unchanged() {
        let sender = Arc::new(CountingSender::failing());
        let trigger = trigger(sender.clone(), Duration::from_secs(60));

        assert!(!trigger.send_if_needed().await);
        assert!(!trigger.is_active().await);

        // Not throttled: the next request tries again straight away.
        sender.failing.store(false, Ordering::SeqCst);
        assert!(trigger.send_if_needed().await);
        assert!(trigger.is_active().await);
        assert_eq!(sender.attempts(), 2);
        assert_eq!(sender.sent(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_send_once() {
        let sender = Arc::new(CountingSender::default());
        let trigger = Arc::new(trigger(sender.clone(), Duration::from_secs(60)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let trigger = trigger.clone();
                tokio::spawn(async move { trigger.send_if_needed().await })
            })
            .collect();

        let mut transmitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                transmitted += 1;
            }
        }
        assert_eq!(transmitted, 1);
        assert_eq!(sender.sent(), 1);
    }

    #[tokio::test]
    async fn test_udp_sender_delivers_magic_packet() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpWakeSender::new(receiver.local_addr().unwrap());

        sender.send(MAC).await.unwrap();

        let mut buf = [0u8; 256];
        let (size, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..size], MagicPacket::new(MAC).as_bytes());
    }
}
