//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use seedpod_core::EngineConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/seedpod/config.toml or /etc/seedpod/config.toml.
/// Env overrides: SEEDPOD_LISTEN_PORT, SEEDPOD_DATA_DIR, SEEDPOD_PEERS (comma-separated
/// addresses).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Package server port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Root of the package store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Whole-request timeout for peer HTTP calls, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// One statically configured peer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    /// Hex package ids the peer is known to hold; omitted means ask about everything.
    #[serde(default)]
    pub packages: Option<Vec<String>>,
}

fn default_listen_port() -> u16 {
    45680
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/seedpod"),
        None => PathBuf::from("/var/lib/seedpod"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_address: default_bind_address(),
            data_dir: default_data_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            peers: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match load_file()? {
        Some(c) => c,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/seedpod/config.toml"));
    }
    out.push(PathBuf::from("/etc/seedpod/config.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    let Some(path) = config_paths().into_iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = parse(&s).with_context(|| format!("parsing {}", path.display()))?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(Some(c))
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("SEEDPOD_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(d) = var("SEEDPOD_DATA_DIR").filter(|s| !s.is_empty()) {
        c.data_dir = PathBuf::from(d);
    }
    if let Some(list) = var("SEEDPOD_PEERS") {
        for addr in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => c.peers.push(PeerEntry {
                    addr,
                    packages: None,
                }),
                Err(e) => tracing::warn!(%addr, error = %e, "ignoring bad SEEDPOD_PEERS entry"),
            }
        }
    }
}
