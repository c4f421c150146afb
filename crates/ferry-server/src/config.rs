use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use ferry_transfer::settings::parse_or;
use ferry_transfer::{DATA_PORT_MAX, DATA_PORT_MIN, DEFAULT_IDLE_TIMEOUT, ServerConfig};

/// Everything the server binary reads from its environment.
#[derive(Debug)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage_dir: PathBuf,
}

impl Settings {
    /// Build settings for the well-known `port` from `var` lookups.
    pub fn load(port: u16, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host: IpAddr = var("FERRY_HOST")
            .unwrap_or_else(|| "0.0.0.0".into())
            .parse()
            .context("FERRY_HOST is not an IP address")?;
        let storage_dir: PathBuf = var("FERRY_STORAGE_DIR").unwrap_or_else(|| ".".into()).into();

        let min = parse_or(&var, "FERRY_DATA_PORT_MIN", DATA_PORT_MIN)?;
        let max = parse_or(&var, "FERRY_DATA_PORT_MAX", DATA_PORT_MAX)?;
        if min > max {
            bail!("FERRY_DATA_PORT_MIN ({min}) is above FERRY_DATA_PORT_MAX ({max})");
        }
        // 0 keeps idle workers alive forever.
        let idle_secs = parse_or(&var, "FERRY_WORKER_IDLE_SECS", DEFAULT_IDLE_TIMEOUT.as_secs())?;

        let mut server = ServerConfig::new(SocketAddr::new(host, port));
        server.data_ports = min..=max;
        server.idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));

        Ok(Self { server, storage_dir })
    }

    pub fn from_env(port: u16) -> anyhow::Result<Self> {
        Self::load(port, |key| std::env::var(key).ok())
    }
}
