//! TOML configuration for netlat.
//!
//! Layered: an explicit `--config` path, else the `NETLAT_CONFIG` environment
//! variable, else `/etc/netlat/netlat.toml`, else compiled-in defaults.
//! Command-line flags override whatever was loaded.

use std::ffi::OsString;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::endpoint::{Family, Transport};
use crate::harness::TimingOptions;
use crate::protocol::xact::MAX_MESSAGE_SIZE;
use crate::registry::Portmapper;
use crate::service::ServiceId;

pub const CONFIG_ENV: &str = "NETLAT_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/netlat/netlat.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetlatConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub portmapper: PortmapperConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where a configuration came from, in lookup order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// `--config`; must load.
    Flag(PathBuf),
    /// `NETLAT_CONFIG`; skipped with a warning when it does not load.
    Env(PathBuf),
    /// System file; skipped silently when absent.
    System(PathBuf),
    Defaults,
}

impl ConfigSource {
    /// Lookup chain for an optional `--config` path and the value of
    /// `NETLAT_CONFIG`. An explicit path is the only candidate.
    pub fn candidates(explicit: Option<&Path>, env: Option<OsString>) -> Vec<ConfigSource> {
        if let Some(path) = explicit {
            return vec![ConfigSource::Flag(path.to_path_buf())];
        }
        let mut chain = Vec::with_capacity(3);
        if let Some(path) = env.filter(|p| !p.is_empty()) {
            chain.push(ConfigSource::Env(PathBuf::from(path)));
        }
        chain.push(ConfigSource::System(PathBuf::from(SYSTEM_CONFIG_PATH)));
        chain.push(ConfigSource::Defaults);
        chain
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Flag(p) => write!(f, "--config {}", p.display()),
            ConfigSource::Env(p) => write!(f, "{CONFIG_ENV}={}", p.display()),
            ConfigSource::System(p) => write!(f, "{}", p.display()),
            ConfigSource::Defaults => f.write_str("compiled-in defaults"),
        }
    }
}

impl NetlatConfig {
    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Configuration for an optional `--config` path, consulting
    /// `NETLAT_CONFIG` and the system file when none is given.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let (config, source) = Self::resolve_from(ConfigSource::candidates(
            explicit,
            std::env::var_os(CONFIG_ENV),
        ))?;
        debug!(%source, "configuration resolved");
        Ok(config)
    }

    /// First candidate that loads, with the source it came from.
    pub fn resolve_from(candidates: Vec<ConfigSource>) -> Result<(Self, ConfigSource)> {
        for source in candidates {
            let path = match &source {
                ConfigSource::Flag(p) | ConfigSource::Env(p) | ConfigSource::System(p) => p.clone(),
                ConfigSource::Defaults => return Ok((Self::default(), source)),
            };
            if matches!(source, ConfigSource::System(_)) && !path.exists() {
                continue;
            }
            match Self::from_file(&path) {
                Ok(config) => {
                    info!(%source, "loaded netlat configuration");
                    return Ok((config, source));
                }
                Err(e) if matches!(source, ConfigSource::Flag(_)) => return Err(e),
                Err(e) => warn!(%source, error = %format!("{e:#}"), "config not loaded, trying next source"),
            }
        }
        Ok((Self::default(), ConfigSource::Defaults))
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.backlog < 1 {
            bail!("network.backlog must be at least 1, got {}", self.network.backlog);
        }
        if self.portmapper.attempts < 1 {
            bail!("portmapper.attempts must be at least 1");
        }
        if self.portmapper.timeout_ms == 0 {
            bail!("portmapper.timeout_ms must be positive");
        }
        if self.bench.repetitions < 1 {
            bail!("bench.repetitions must be at least 1");
        }
        if self.bench.message_size == 0 || self.bench.message_size > MAX_MESSAGE_SIZE {
            bail!(
                "bench.message_size must be within 1..={}, got {}",
                MAX_MESSAGE_SIZE,
                self.bench.message_size
            );
        }
        Ok(())
    }

    /// Naming-service client for this configuration.
    pub fn portmapper(&self) -> Portmapper {
        Portmapper::new(
            self.portmapper.local_address,
            self.portmapper.port,
            Duration::from_millis(self.portmapper.timeout_ms),
            self.portmapper.attempts,
        )
    }

    pub fn timing(&self) -> TimingOptions {
        TimingOptions {
            repetitions: self.bench.repetitions,
            warmup: Duration::from_millis(self.bench.warmup_ms),
            min_duration: Duration::from_millis(self.bench.min_duration_ms),
        }
    }

    /// Client transport; vsock needs the peer's context id.
    pub fn transport(&self) -> Result<Transport> {
        match (self.network.transport, self.network.vsock_cid) {
            (Family::Inet, _) => Ok(Transport::Inet),
            (Family::Vsock, Some(cid)) => Ok(Transport::Vsock { cid }),
            (Family::Vsock, None) => bail!("vsock transport needs network.vsock_cid"),
        }
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IPv4 address servers bind to.
    pub bind_address: Ipv4Addr,
    /// Listen backlog.
    pub backlog: i32,
    /// `inet` or `vsock`.
    pub transport: Family,
    /// Context id clients connect to over vsock.
    pub vsock_cid: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            backlog: 100,
            transport: Family::Inet,
            vsock_cid: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Service identifiers: negative for a fixed port, positive for a program
/// number looked up through the portmapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub connect: ServiceId,
    pub transaction: ServiceId,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            connect: ServiceId::CONNECT,
            transaction: ServiceId::XACT,
        }
    }
}

// ---------------------------------------------------------------------------
// Portmapper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortmapperConfig {
    /// Portmapper used for registration and removal.
    pub local_address: SocketAddrV4,
    /// Portmapper port queried on the server host for lookups.
    pub port: u16,
    /// Per-attempt reply timeout.
    pub timeout_ms: u64,
    pub attempts: u32,
}

impl Default for PortmapperConfig {
    fn default() -> Self {
        Self {
            local_address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 111),
            port: 111,
            timeout_ms: 1000,
            attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Bench
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub repetitions: u32,
    pub warmup_ms: u64,
    /// Minimum length of one timed batch.
    pub min_duration_ms: u64,
    /// Transaction payload size in bytes.
    pub message_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            repetitions: 11,
            warmup_ms: 0,
            min_duration_ms: 20,
            message_size: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
