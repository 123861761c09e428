//! Shared configuration for the SDCP CLI and gateway.
//!
//! TOML printer profiles, broker and gateway settings, access-code
//! resolution (env + plaintext), and translation to
//! `sdcp_core::PrinterConfig`. Layering is serialized defaults, then the
//! TOML file, then `SDCP_`-prefixed environment variables with `__` as the
//! nesting separator (`SDCP_GATEWAY__HTTP_PORT=8080`).

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sdcp_api::BrokerConfig;
use sdcp_core::{Device, PrinterConfig, TransportKind};

pub const ENV_PREFIX: &str = "SDCP_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no printer profile named '{name}'")]
    UnknownPrinter { name: String },

    #[error("no printer selected: pass a printer name or set default_printer")]
    NoPrinterSelected,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when no printer is named.
    pub default_printer: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Named printer profiles.
    #[serde(default)]
    pub printers: BTreeMap<String, PrinterProfile>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    /// Seconds.
    pub command_timeout: u64,
    /// Seconds.
    pub discovery_timeout: u64,
    /// Status push period for broker-mediated MQTT printers, milliseconds.
    pub status_period_ms: u64,
    pub output: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            command_timeout: 10,
            discovery_timeout: 3,
            status_period_ms: 5000,
            output: "table".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub bind: IpAddr,
    pub port: u16,
    /// Largest MQTT packet the embedded broker accepts, in bytes.
    pub max_packet_size: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: sdcp_api::mqtt::DEFAULT_BROKER_PORT,
            max_packet_size: sdcp_api::mqtt::packet::DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl BrokerSettings {
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind: self.bind,
            port: self.port,
            max_packet_size: self.max_packet_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind: IpAddr,
    pub http_port: u16,
    pub video_port: u16,
    pub discovery_port: u16,
    /// Host name or address clients use to reach the gateway. Detected
    /// from the outbound interface when unset.
    pub external_host: Option<String>,
    /// Window for suppressing repeated discovery probes, seconds.
    pub rate_limit_secs: u64,
    /// Stop serving once the last printer is unregistered.
    pub shutdown_when_empty: bool,
    /// Register every printer discovery finds at start-up.
    pub auto_discover: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 3030,
            video_port: 3031,
            discovery_port: 3000,
            external_host: None,
            rate_limit_secs: 30,
            shutdown_when_empty: false,
            auto_discover: true,
        }
    }
}

/// A named printer profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrinterProfile {
    /// Printer address.
    pub host: String,

    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Mainboard id (SDCP) or serial number (inverted MQTT).
    pub id: String,

    #[serde(default)]
    pub model: Option<String>,

    /// WebSocket port, broker port, or handshake port override.
    #[serde(default)]
    pub port: Option<u16>,

    /// Inverted-MQTT access code (plaintext; prefer `access_code_env`).
    #[serde(default)]
    pub access_code: Option<String>,

    /// Environment variable holding the access code.
    #[serde(default)]
    pub access_code_env: Option<String>,

    /// Override `defaults.command_timeout`, seconds.
    #[serde(default)]
    pub command_timeout: Option<u64>,
}

fn default_transport() -> TransportKind {
    TransportKind::WebSocket
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "sdcp", "sdcp").map_or_else(
        || PathBuf::from(".sdcp").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load from `path` (or the canonical path) plus the environment. A
/// missing file is not an error.
pub fn load_config_from(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(None)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path` (or the canonical path).
pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, toml::to_string_pretty(cfg)?)?;
    Ok(path)
}

// ── Validation and lookup ───────────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in &self.printers {
            if profile.host.trim().is_empty() {
                return Err(ConfigError::Validation {
                    field: format!("printers.{name}.host"),
                    reason: "must not be empty".into(),
                });
            }
            if profile.id.trim().is_empty() {
                return Err(ConfigError::Validation {
                    field: format!("printers.{name}.id"),
                    reason: "mainboard id or serial is required".into(),
                });
            }
        }
        if let Some(default) = &self.default_printer {
            if !self.printers.contains_key(default) {
                return Err(ConfigError::Validation {
                    field: "default_printer".into(),
                    reason: format!("no profile named '{default}'"),
                });
            }
        }
        Ok(())
    }

    /// Pick a profile by name, falling back to `default_printer`, then to
    /// the only profile if exactly one exists.
    pub fn select_printer(
        &self,
        name: Option<&str>,
    ) -> Result<(&str, &PrinterProfile), ConfigError> {
        let name = match name.or(self.default_printer.as_deref()) {
            Some(name) => name,
            None if self.printers.len() == 1 => self
                .printers
                .keys()
                .next()
                .map(String::as_str)
                .ok_or(ConfigError::NoPrinterSelected)?,
            None => return Err(ConfigError::NoPrinterSelected),
        };
        self.printers
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownPrinter { name: name.into() })
    }
}

// ── Translation to core config ──────────────────────────────────────

/// Resolve an access code: the profile's env var first, then plaintext.
pub fn resolve_access_code(profile: &PrinterProfile) -> Option<SecretString> {
    profile
        .access_code_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|code| !code.is_empty())
        .or_else(|| profile.access_code.clone())
        .map(SecretString::from)
}

/// Build a `PrinterConfig` from a profile and the global defaults.
pub fn profile_to_printer_config(profile: &PrinterProfile, defaults: &Defaults) -> PrinterConfig {
    let device = Device::new(
        profile.id.clone(),
        profile.host.clone(),
        profile.model.clone().unwrap_or_default(),
        profile.transport,
    );
    let mut config = PrinterConfig::new(device).with_command_timeout(Duration::from_secs(
        profile.command_timeout.unwrap_or(defaults.command_timeout),
    ));
    config.status_period = Duration::from_millis(defaults.status_period_ms);
    config.port = profile.port;
    config.access_code = resolve_access_code(profile);
    config
}
