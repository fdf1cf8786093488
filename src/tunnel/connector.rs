use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ConnectError;
use crate::events::{Event, FailureKind};
use crate::transport::{BoxedStream, TargetDialer};
use crate::tunnel::ConnectionId;
use crate::wake::WakeTrigger;

type DialFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

/// Timing knobs of the connect/wake cycle.
#[derive(Copy, Clone, Debug)]
pub struct ConnectorTiming {
    pub grace_period: Duration,
    pub retry_interval: Duration,
}

/// Owns the outbound connection attempts made on behalf of one client.
///
/// A connect that has not completed within the grace period wakes the target. Attempts failing
/// because the target looks offline are retried promptly while a wake is active, otherwise the
/// next grace timer retries them. Other failures end the connector.
pub struct TargetConnector {
    id: ConnectionId,
    dialer: Arc<dyn TargetDialer>,
    wake: Arc<WakeTrigger>,
    timing: ConnectorTiming,
    state: ConnectorState,
    /// The single in-flight attempt, if any.
    attempt: Option<DialFuture>,
    /// Grace deadline of the latest attempt. A newer attempt replaces it.
    grace_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    /// Stream handed out once `Connected`.
    stream: Option<BoxedStream>,
}

impl TargetConnector {
    pub fn new(
        id: ConnectionId,
        dialer: Arc<dyn TargetDialer>,
        wake: Arc<WakeTrigger>,
        timing: ConnectorTiming,
    ) -> Self {
        Self {
            id,
            dialer,
            wake,
            timing,
            state: ConnectorState::Disconnected,
            attempt: None,
            grace_deadline: None,
            retry_at: None,
            stream: None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// Starts an attempt unless one is in flight or the target is already connected.
    /// Returns whether a new attempt was started.
    pub fn connect(&mut self) -> bool {
        if self.state != ConnectorState::Disconnected {
            trace!("{} Connect skipped, target is {:?}", self.id, self.state);
            return false;
        }

        debug!("{} Connecting to target", self.id);
        self.state = ConnectorState::Connecting;
        self.retry_at = None;
        self.grace_deadline = Some(Instant::now() + self.timing.grace_period);

        let dialer = self.dialer.clone();
        self.attempt = Some(Box::pin(async move { dialer.dial().await }));
        true
    }

    /// Connects, waking the target as needed, until a stream is established or an attempt fails
    /// for a reason other than the target being offline.
    pub async fn run(&mut self) -> Result<BoxedStream, ConnectError> {
        self.connect();
        loop {
            let event = self.next_event().await;
            trace!("{} {}", self.id, event);
            self.handle_event(event).await?;
            if let Some(stream) = self.stream.take() {
                return Ok(stream);
            }
        }
    }

    /// Applies one transition.
    pub async fn handle_event(&mut self, event: Event) -> Result<(), ConnectError> {
        match event {
            Event::Connected => {
                info!("{} Connected to target", self.id);
                self.state = ConnectorState::Connected;
                self.grace_deadline = None;
                self.retry_at = None;
            }
            Event::Closed => {
                debug!("{} Target stream closed", self.id);
                self.state = ConnectorState::Disconnected;
            }
            Event::ConnectFailed(e) => {
                self.state = ConnectorState::Disconnected;
                match FailureKind::classify(&e) {
                    FailureKind::Transient => {
                        if self.wake.is_active().await {
                            debug!(
                                "{} Target still offline ({}), retrying while it boots",
                                self.id, e
                            );
                            self.retry_at = Some(Instant::now() + self.timing.retry_interval);
                        } else {
                            debug!(
                                "{} Target offline ({}), waiting for the grace period",
                                self.id, e
                            );
                            // The attempt outlived its grace timer, or the wake lapsed since.
                            if self.grace_deadline.is_none() {
                                self.grace_deadline =
                                    Some(Instant::now() + self.timing.grace_period);
                            }
                        }
                    }
                    FailureKind::Unclassified => {
                        warn!("{} Unhandled error connecting to target: {:?}", self.id, e);
                        self.grace_deadline = None;
                        return Err(ConnectError::Unclassified(e));
                    }
                }
            }
            Event::GraceElapsed => {
                if self.state != ConnectorState::Connected {
                    wake_up_target(self.id, &self.wake).await;
                }
                if self.state == ConnectorState::Disconnected {
                    self.connect();
                }
            }
            Event::RetryDue => {
                self.connect();
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Event {
        let grace_deadline = self.grace_deadline;
        let retry_at = self.retry_at;

        tokio::select! {
            result = poll_attempt(&mut self.attempt) => {
                self.attempt = None;
                match result {
                    Ok(stream) => {
                        self.stream = Some(stream);
                        Event::Connected
                    }
                    Err(e) => Event::ConnectFailed(e),
                }
            }
            _ = sleep_until(grace_deadline) => {
                self.grace_deadline = None;
                Event::GraceElapsed
            }
            _ = sleep_until(retry_at) => {
                self.retry_at = None;
                Event::RetryDue
            }
        }
    }
}

/// No-op while a wake is active; the trigger logs the outcome.
async fn wake_up_target(id: ConnectionId, wake: &WakeTrigger) {
    if !wake.send_if_needed().await {
        trace!("{} No magic packet sent for {}", id, wake.mac());
    }
}

async fn poll_attempt(attempt: &mut Option<DialFuture>) -> io::Result<BoxedStream> {
    match attempt {
        Some(attempt) => attempt.await,
        None => futures::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
