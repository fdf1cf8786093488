use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "bin")]
use anyhow::Context;

use crate::error::ConfigError;

/// Minimum time between two magic packets for the same target.
pub const DEFAULT_WAKE_COOLDOWN: Duration = Duration::from_secs(60);
/// How long a connect may stay pending before the target is presumed asleep.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);
/// Delay between reconnect attempts while a wake is active.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound for a single outbound connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Limited broadcast on the discard port, the conventional magic packet destination.
pub const DEFAULT_WAKE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 9);

const DEFAULT_TARGET_HOSTNAME: &str = "localhost";

/// A 48-bit hardware address.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = ConfigError;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`, in any letter case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidMac(s.to_string());
        let separator = if s.contains(':') { ':' } else { '-' };

        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(separator);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

/// PEM certificate chain and private key for the listening side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// TLS options for the outbound leg.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientTlsConfig {
    /// Name to verify the target certificate against. Defaults to the target hostname.
    pub server_name: Option<String>,
    /// PEM bundle of trusted roots. Defaults to the webpki roots.
    pub ca_path: Option<PathBuf>,
    /// Accept any certificate the target presents.
    pub insecure_skip_verify: bool,
}

/// Where the proxy listens.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceConfig {
    pub port: u16,
    pub interface: IpAddr,
    pub tls: Option<ServerTlsConfig>,
}

impl SourceConfig {
    /// Listens on all interfaces without TLS.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tls: None,
        }
    }

    pub fn with_interface(mut self, interface: IpAddr) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }
}

impl FromStr for SourceConfig {
    type Err = ConfigError;

    /// A bare port number, e.g. `"9000"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_port(s).map(Self::new)
    }
}

/// The machine being proxied to, and woken up when it is asleep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetConfig {
    pub hostname: String,
    pub port: u16,
    pub mac: MacAddress,
    pub tls: Option<ClientTlsConfig>,
}

impl TargetConfig {
    pub fn new(port: u16, mac: MacAddress) -> Self {
        Self {
            hostname: DEFAULT_TARGET_HOSTNAME.to_string(),
            port,
            mac,
            tls: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl Display for TargetConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.hostname, self.port, self.mac)
    }
}

/// Immutable configuration of a running proxy. Built with [`ProxyConfig::builder`].
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub wake_cooldown: Duration,
    pub grace_period: Duration,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub wake_addr: SocketAddr,
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProxyConfigBuilder {
    source: Option<SourceConfig>,
    target: Option<TargetConfig>,
    wake_cooldown: Option<Duration>,
    grace_period: Option<Duration>,
    retry_interval: Option<Duration>,
    connect_timeout: Option<Duration>,
    wake_addr: Option<SocketAddr>,
}

impl ProxyConfigBuilder {
    pub fn source(mut self, source: SourceConfig) -> Self {
        self.source = Some(source);
        self
    }

    pub fn target(mut self, target: TargetConfig) -> Self {
        self.target = Some(target);
        self
    }

    pub fn wake_cooldown(mut self, cooldown: Duration) -> Self {
        self.wake_cooldown = Some(cooldown);
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn wake_addr(mut self, wake_addr: SocketAddr) -> Self {
        self.wake_addr = Some(wake_addr);
        self
    }

    /// Fails when either endpoint is missing; everything else has a default.
    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        Ok(ProxyConfig {
            source: self.source.ok_or(ConfigError::MissingSource)?,
            target: self.target.ok_or(ConfigError::MissingTarget)?,
            wake_cooldown: self.wake_cooldown.unwrap_or(DEFAULT_WAKE_COOLDOWN),
            grace_period: self.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD),
            retry_interval: self.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            wake_addr: self.wake_addr.unwrap_or(DEFAULT_WAKE_ADDR),
        })
    }
}

pub fn parse_port(s: &str) -> Result<u16, ConfigError> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort(s.to_string()))
}

/// Command-line configuration of the `wol-proxy` binary.
#[cfg(feature = "bin")]
#[derive(Clone, Debug)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub log: String,
}

#[cfg(feature = "bin")]
impl Config {
    pub fn from_args() -> anyhow::Result<Self> {
        use clap::{Arg, ArgAction, Command};

        let matches = Command::new("wol-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Forwards TCP connections to a target, waking it with Wake-on-LAN when it is asleep.")
            .args([
                Arg::new("SOURCE_PORT")
                    .required(true)
                    .num_args(1)
                    .env("WOLPROXY_SOURCE_PORT")
                    .help("The port to listen on. Example: 9000"),
                Arg::new("TARGET_PORT")
                    .required(true)
                    .num_args(1)
                    .env("WOLPROXY_TARGET_PORT")
                    .help("The port of the target machine to forward to. Example: 22"),
                Arg::new("mac")
                    .required(true)
                    .num_args(1)
                    .long("mac")
                    .env("WOLPROXY_MAC")
                    .help("Hardware address of the target, used for the magic packet. Example: 00:11:22:33:44:55"),
                Arg::new("interface")
                    .required(false)
                    .num_args(1)
                    .long("interface")
                    .env("WOLPROXY_INTERFACE")
                    .default_value("0.0.0.0")
                    .help("The interface (IP) to listen on."),
                Arg::new("source-cert")
                    .required(false)
                    .num_args(1)
                    .long("source-cert")
                    .env("WOLPROXY_SOURCE_CERT")
                    .requires("source-key")
                    .help("PEM certificate chain. Enables TLS for incoming connections."),
                Arg::new("source-key")
                    .required(false)
                    .num_args(1)
                    .long("source-key")
                    .env("WOLPROXY_SOURCE_KEY")
                    .requires("source-cert")
                    .help("PEM private key matching --source-cert."),
                Arg::new("target-host")
                    .required(false)
                    .num_args(1)
                    .long("target-host")
                    .env("WOLPROXY_TARGET_HOST")
                    .default_value(DEFAULT_TARGET_HOSTNAME)
                    .help("Hostname or IP of the target machine."),
                Arg::new("target-tls")
                    .long("target-tls")
                    .env("WOLPROXY_TARGET_TLS")
                    .action(ArgAction::SetTrue)
                    .help("Connect to the target over TLS."),
                Arg::new("target-server-name")
                    .required(false)
                    .num_args(1)
                    .long("target-server-name")
                    .env("WOLPROXY_TARGET_SERVER_NAME")
                    .help("Server name to verify the target certificate against. Defaults to --target-host."),
                Arg::new("target-ca")
                    .required(false)
                    .num_args(1)
                    .long("target-ca")
                    .env("WOLPROXY_TARGET_CA")
                    .help("PEM bundle of roots trusted for the target certificate."),
                Arg::new("target-insecure")
                    .long("target-insecure")
                    .env("WOLPROXY_TARGET_INSECURE")
                    .action(ArgAction::SetTrue)
                    .help("Skip verification of the target certificate."),
                Arg::new("wake-addr")
                    .required(false)
                    .num_args(1)
                    .long("wake-addr")
                    .env("WOLPROXY_WAKE_ADDR")
                    .help("Address the magic packet is broadcast to. Default: 255.255.255.255:9"),
                Arg::new("wake-cooldown")
                    .required(false)
                    .num_args(1)
                    .long("wake-cooldown")
                    .env("WOLPROXY_WAKE_COOLDOWN")
                    .help("Minimum number of seconds between two magic packets. Default: 60"),
                Arg::new("grace-period")
                    .required(false)
                    .num_args(1)
                    .long("grace-period")
                    .env("WOLPROXY_GRACE_PERIOD")
                    .help("Milliseconds to wait for the target to accept before waking it. Default: 3000"),
                Arg::new("log")
                    .required(false)
                    .num_args(1)
                    .long("log")
                    .env("WOLPROXY_LOG")
                    .default_value("info")
                    .help("Configures the log level and format."),
            ])
            .get_matches();

        let value = |id: &str| matches.get_one::<String>(id).map(String::as_str);

        let interface = parse_ip(value("interface")).with_context(|| "Invalid interface")?;
        let mut source = parse_port(value("SOURCE_PORT").unwrap_or_default())
            .map(SourceConfig::new)
            .with_context(|| "Invalid source port")?
            .with_interface(interface);
        if let (Some(cert), Some(key)) = (value("source-cert"), value("source-key")) {
            source = source.with_tls(ServerTlsConfig {
                cert_path: cert.into(),
                key_path: key.into(),
            });
        }

        let mac = value("mac")
            .with_context(|| "Missing hardware address")?
            .parse::<MacAddress>()
            .with_context(|| "Invalid hardware address")?;
        let target_port = parse_port(value("TARGET_PORT").unwrap_or_default())
            .with_context(|| "Invalid target port")?;
        let mut target = TargetConfig::new(target_port, mac)
            .with_hostname(value("target-host").unwrap_or(DEFAULT_TARGET_HOSTNAME));
        if matches.get_flag("target-tls") {
            target = target.with_tls(ClientTlsConfig {
                server_name: value("target-server-name").map(String::from),
                ca_path: value("target-ca").map(PathBuf::from),
                insecure_skip_verify: matches.get_flag("target-insecure"),
            });
        }

        let mut builder = ProxyConfig::builder().source(source).target(target);
        if let Some(addr) = value("wake-addr") {
            builder = builder.wake_addr(parse_addr(addr).with_context(|| "Invalid wake address")?);
        }
        if let Some(secs) = value("wake-cooldown") {
            builder = builder.wake_cooldown(Duration::from_secs(
                parse_number(secs).with_context(|| "Invalid wake cool-down")?,
            ));
        }
        if let Some(millis) = value("grace-period") {
            builder = builder.grace_period(Duration::from_millis(
                parse_number(millis).with_context(|| "Invalid grace period")?,
            ));
        }

        Ok(Self {
            proxy: builder.build()?,
            log: value("log").unwrap_or("info").into(),
        })
    }
}

#[cfg(feature = "bin")]
fn parse_ip(s: Option<&str>) -> anyhow::Result<IpAddr> {
    s.with_context(|| "Missing IP")?
        .parse::<IpAddr>()
        .with_context(|| "Invalid IP address")
}

#[cfg(feature = "bin")]
fn parse_addr(s: &str) -> anyhow::Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    s.to_socket_addrs()
        .with_context(|| "Invalid address")?
        .next()
        .with_context(|| "Could not lookup address")
}

#[cfg(feature = "bin")]
fn parse_number(s: &str) -> anyhow::Result<u64> {
    s.trim()
        .parse::<u64>()
        .with_context(|| format!("'{}' is not a non-negative integer", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress::new([0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]);

    #[test]
    fn test_parse_mac_separators() {
        assert_eq!("00:11:22:aa:bb:cc".parse::<MacAddress>().unwrap(), MAC);
        assert_eq!("00-11-22-AA-BB-CC".parse::<MacAddress>().unwrap(), MAC);
        assert_eq!(MAC.to_string(), "00:11:22:aa:bb:cc");
    }

    #[test]
    fn test_parse_mac_rejects_malformed() {
        for bad in [
            "",
            "00:11:22:aa:bb",
            "00:11:22:aa:bb:cc:dd",
            "00:11:22:aa:bb:zz",
            "0:11:22:aa:bb:cc",
            "001122aabbcc",
            "+a:11:22:33:44:55",
            "00:11:22:aa:bb:-c",
        ] {
            assert!(
                matches!(bad.parse::<MacAddress>(), Err(ConfigError::InvalidMac(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_source_from_numeric_string() {
        let source: SourceConfig = "9000".parse().unwrap();
        assert_eq!(source.port, 9000);
        assert_eq!(source.bind_addr(), "0.0.0.0:9000".parse().unwrap());
        assert!(source.tls.is_none());
        assert!(matches!(
            "ninety".parse::<SourceConfig>(),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_target_defaults_to_localhost() {
        let target = TargetConfig::new(22, MAC);
        assert_eq!(target.hostname, "localhost");
        assert_eq!(target.with_hostname("10.0.0.5").hostname, "10.0.0.5");
    }

    #[test]
    fn test_builder_requires_both_endpoints() {
        let missing_target = ProxyConfig::builder()
            .source(SourceConfig::new(9000))
            .build();
        assert!(matches!(missing_target, Err(ConfigError::MissingTarget)));

        let missing_source = ProxyConfig::builder()
            .target(TargetConfig::new(22, MAC))
            .build();
        assert!(matches!(missing_source, Err(ConfigError::MissingSource)));
    }

    #[test]
    fn test_builder_defaults_and_overrides() {
        let config = ProxyConfig::builder()
            .source(SourceConfig::new(9000))
            .target(TargetConfig::new(22, MAC))
            .wake_cooldown(Duration::from_secs(120))
            .build()
            .unwrap();
        assert_eq!(config.wake_cooldown, Duration::from_secs(120));
        assert_eq!(config.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);
        assert_eq!(config.wake_addr, DEFAULT_WAKE_ADDR);
    }
}
