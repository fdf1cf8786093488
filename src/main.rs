#[cfg(feature = "bin")]
#[macro_use]
extern crate log;

#[cfg(feature = "bin")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use wol_proxy::config::Config;

    let config = Config::from_args().context("Configuration has errors")?;
    init_logger(&config)?;

    debug!("Parsed arguments: {:?}", config);
    info!(
        "Waking {} via magic packets to {} (cool-down {:?}, grace period {:?})",
        config.proxy.target.mac,
        config.proxy.wake_addr,
        config.proxy.wake_cooldown,
        config.proxy.grace_period
    );

    wol_proxy::start_proxy(config.proxy).await
}

#[cfg(not(feature = "bin"))]
fn main() -> anyhow::Result<()> {
    Err(anyhow::anyhow!("Binary compiled without 'bin' feature"))
}

#[cfg(feature = "bin")]
fn init_logger(config: &wol_proxy::config::Config) -> anyhow::Result<()> {
    use anyhow::Context;

    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.parse_filters(&config.log);
    builder
        .try_init()
        .with_context(|| "Failed to initialize logger")
}
