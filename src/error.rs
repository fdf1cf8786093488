use std::io;

/// Invalid or incomplete proxy configuration. Raised before any socket is opened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing source configuration")]
    MissingSource,
    #[error("Missing target configuration")]
    MissingTarget,
    #[error("Invalid hardware address '{0}': expected 6 hex octets separated by ':' or '-'")]
    InvalidMac(String),
    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}

/// Outbound failure that the connector gives up on.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Not one of the "target is offline" kinds; retrying would not help.
    #[error("Unclassified error connecting to target: {0}")]
    Unclassified(#[source] io::Error),
}
