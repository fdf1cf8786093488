use std::fmt::{Display, Formatter};
use std::io;

/// Events that drive a [`TargetConnector`](crate::tunnel::connector::TargetConnector).
#[derive(Debug)]
pub enum Event {
    /// The in-flight connect attempt reached the target.
    Connected,
    /// The in-flight connect attempt failed.
    ConnectFailed(io::Error),
    /// The established target stream was closed.
    Closed,
    /// The grace period of the latest attempt ran out before it connected.
    GraceElapsed,
    /// A reconnect scheduled while the target is presumed booting is due.
    RetryDue,
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Connected => {
                write!(f, "Connected{{}}")
            }
            Event::ConnectFailed(e) => {
                write!(f, "ConnectFailed{{ kind={:?} error={} }}", e.kind(), e)
            }
            Event::Closed => {
                write!(f, "Closed{{}}")
            }
            Event::GraceElapsed => {
                write!(f, "GraceElapsed{{}}")
            }
            Event::RetryDue => {
                write!(f, "RetryDue{{}}")
            }
        }
    }
}

/// How the connector reacts to a failed outbound attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The target looks offline: it may be asleep or still booting.
    Transient,
    /// Anything else; not retried.
    Unclassified,
}

impl FailureKind {
    pub fn classify(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable => FailureKind::Transient,
            _ => FailureKind::Unclassified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_offline_kinds_as_transient() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut,
            io::ErrorKind::HostUnreachable,
            io::ErrorKind::NetworkUnreachable,
        ] {
            assert_eq!(
                FailureKind::classify(&io::Error::from(kind)),
                FailureKind::Transient
            );
        }
    }

    #[test]
    fn test_classify_other_kinds_as_unclassified() {
        for kind in [
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidData,
            io::ErrorKind::AddrNotAvailable,
        ] {
            assert_eq!(
                FailureKind::classify(&io::Error::from(kind)),
                FailureKind::Unclassified
            );
        }
    }

    #[test]
    fn test_display() {
        let event = Event::ConnectFailed(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(event.to_string().starts_with("ConnectFailed{ kind=ConnectionRefused"));
        assert_eq!(Event::GraceElapsed.to_string(), "GraceElapsed{}");
    }
}
