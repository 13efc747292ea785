//! Source and application configuration
//!
//! `SourceConfig` is what the coordinator consumes. `AppConfig` wraps it
//! with the status API settings and is persisted as TOML in the platform
//! config directory (`C64U_CONFIG` overrides the path).

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_AUDIO_PORT, DEFAULT_BUFFER_DELAY_MS, DEFAULT_DEVICE_HOST, DEFAULT_STATUS_PORT,
    DEFAULT_VIDEO_PORT, MAX_BUFFER_DELAY_MS, OFFLINE_HOST,
};
use crate::error::ConfigError;

/// Environment variable overriding the config file path
pub const CONFIG_PATH_ENV: &str = "C64U_CONFIG";

const MIN_PORT: u16 = 1024;

/// Settings for one C64 Ultimate source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Hostname or IPv4 address of the device; `0.0.0.0` disables control traffic
    pub device_host: String,
    /// DNS server tried first for direct lookups
    pub dns_server: Option<String>,
    /// Address advertised to the device when auto-detection is off
    pub host_ip: Option<String>,
    pub auto_detect_host_ip: bool,
    pub video_port: u16,
    pub audio_port: u16,
    /// Jitter buffer delay; 0 selects the default
    pub buffer_delay_ms: u32,
    pub debug_logging: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device_host: DEFAULT_DEVICE_HOST.to_string(),
            dns_server: None,
            host_ip: None,
            auto_detect_host_ip: true,
            video_port: DEFAULT_VIDEO_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            buffer_delay_ms: DEFAULT_BUFFER_DELAY_MS,
            debug_logging: false,
        }
    }
}

/// What changed between two source configurations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub ports: bool,
    /// Device host, DNS server or advertised address
    pub endpoints: bool,
    pub delay: bool,
    pub debug_logging: bool,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl SourceConfig {
    /// Check ranges and addresses
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, port) in [("video", self.video_port), ("audio", self.audio_port)] {
            if port < MIN_PORT {
                return Err(ConfigError::InvalidPort { name, port });
            }
        }
        if self.video_port == self.audio_port {
            return Err(ConfigError::PortConflict(self.video_port));
        }
        if self.buffer_delay_ms > MAX_BUFFER_DELAY_MS {
            return Err(ConfigError::InvalidDelay(self.buffer_delay_ms));
        }

        let host = self.device_host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidHost(self.device_host.clone()));
        }

        parse_optional_ip("dns_server", self.dns_server.as_deref())?;
        parse_optional_ip("host_ip", self.host_ip.as_deref())?;
        Ok(())
    }

    /// Device host with surrounding whitespace removed
    pub fn host(&self) -> &str {
        self.device_host.trim()
    }

    /// Whether control traffic is disabled
    pub fn is_offline(&self) -> bool {
        self.host() == OFFLINE_HOST
    }

    /// Delay the jitter buffers run with
    pub fn effective_delay_ms(&self) -> u32 {
        match self.buffer_delay_ms {
            0 => DEFAULT_BUFFER_DELAY_MS,
            ms => ms.min(MAX_BUFFER_DELAY_MS),
        }
    }

    /// Manually configured address to advertise, if auto-detection is off
    pub fn manual_host_ip(&self) -> Option<Ipv4Addr> {
        if self.auto_detect_host_ip {
            return None;
        }
        parse_optional_ip("host_ip", self.host_ip.as_deref()).ok().flatten()
    }

    pub fn dns_server(&self) -> Option<&str> {
        self.dns_server.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Compare against the configuration currently applied
    pub fn diff(&self, previous: &SourceConfig) -> ConfigDiff {
        ConfigDiff {
            ports: self.video_port != previous.video_port || self.audio_port != previous.audio_port,
            endpoints: self.host() != previous.host()
                || self.dns_server() != previous.dns_server()
                || self.auto_detect_host_ip != previous.auto_detect_host_ip
                || self.host_ip != previous.host_ip,
            delay: self.effective_delay_ms() != previous.effective_delay_ms(),
            debug_logging: self.debug_logging != previous.debug_logging,
        }
    }

    /// Apply `C64U_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`; unparsable values are ignored with a warning
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("C64U_HOST") {
            self.device_host = host;
        }
        if let Some(port) = parse_override(&lookup, "C64U_VIDEO_PORT") {
            self.video_port = port;
        }
        if let Some(port) = parse_override(&lookup, "C64U_AUDIO_PORT") {
            self.audio_port = port;
        }
        if let Some(delay) = parse_override(&lookup, "C64U_DELAY_MS") {
            self.buffer_delay_ms = delay;
        }
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

fn parse_optional_ip(field: &'static str, value: Option<&str>) -> Result<Option<Ipv4Addr>, ConfigError> {
    match value.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidAddress {
                field,
                value: s.to_string(),
            }),
    }
}

/// Status API settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_STATUS_PORT,
        }
    }
}

/// Persistent application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub status: StatusConfig,
}

impl AppConfig {
    /// Config file path: `C64U_CONFIG`, else `<config_dir>/c64u-receiver/config.toml`
    pub fn path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        directories::ProjectDirs::from("", "", "c64u-receiver")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: Self = toml::from_str(&contents)?;
                tracing::info!(path = %path.display(), "Loaded config from disk");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load from the default path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path())
    }

    /// Save to `path`, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SourceConfig::default();
        assert_eq!(config.device_host, "c64u");
        assert_eq!(config.video_port, 11000);
        assert_eq!(config.audio_port, 11001);
        assert_eq!(config.buffer_delay_ms, 10);
        assert!(config.auto_detect_host_ip);
        assert!(config.validate().is_ok());
        assert!(!config.is_offline());
    }

    #[test]
    fn test_validate_ports() {
        let config = SourceConfig {
            video_port: 80,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPort { name: "video", port: 80 })
        ));

        let config = SourceConfig {
            audio_port: 11000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::PortConflict(11000))));
    }

    #[test]
    fn test_validate_delay_and_host() {
        let config = SourceConfig {
            buffer_delay_ms: 501,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDelay(501))));

        let config = SourceConfig {
            device_host: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHost(_))));

        let config = SourceConfig {
            dns_server: Some("dns.local".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress { field: "dns_server", .. })
        ));
    }

    #[test]
    fn test_zero_delay_uses_default() {
        let config = SourceConfig {
            buffer_delay_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.effective_delay_ms(), 10);
        assert_eq!(
            SourceConfig {
                buffer_delay_ms: 250,
                ..Default::default()
            }
            .effective_delay_ms(),
            250
        );
    }

    #[test]
    fn test_manual_host_ip() {
        let mut config = SourceConfig {
            host_ip: Some("192.168.1.10".into()),
            ..Default::default()
        };
        assert_eq!(config.manual_host_ip(), None);
        config.auto_detect_host_ip = false;
        assert_eq!(config.manual_host_ip(), Some(Ipv4Addr::new(192, 168, 1, 10)));
        config.host_ip = Some(String::new());
        assert_eq!(config.manual_host_ip(), None);
    }

    #[test]
    fn test_diff() {
        let base = SourceConfig::default();
        assert!(base.diff(&base).is_empty());

        let moved = SourceConfig {
            video_port: 12000,
            buffer_delay_ms: 50,
            ..Default::default()
        };
        let diff = moved.diff(&base);
        assert!(diff.ports);
        assert!(diff.delay);
        assert!(!diff.endpoints);

        let rehomed = SourceConfig {
            device_host: "192.168.1.64".into(),
            ..Default::default()
        };
        assert!(rehomed.diff(&base).endpoints);

        // 0 and 10 run with the same delay
        let zero = SourceConfig {
            buffer_delay_ms: 0,
            ..Default::default()
        };
        assert!(!zero.diff(&base).delay);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("C64U_HOST", "0.0.0.0"),
            ("C64U_VIDEO_PORT", "12000"),
            ("C64U_AUDIO_PORT", "not-a-port"),
            ("C64U_DELAY_MS", "40"),
        ]
        .into_iter()
        .collect();

        let mut config = SourceConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert!(config.is_offline());
        assert_eq!(config.video_port, 12000);
        assert_eq!(config.audio_port, 11001);
        assert_eq!(config.buffer_delay_ms, 40);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [source]
            device_host = "192.168.1.64"

            [status]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.source.device_host, "192.168.1.64");
        assert_eq!(config.source.video_port, 11000);
        assert_eq!(config.status.port, 9000);
        assert!(config.status.enabled);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("c64u-config-test-{}", std::process::id()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.source.device_host = "c64u.lan".into();
        config.source.dns_server = Some("192.168.1.1".into());
        config.status.enabled = false;
        config.save(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("c64u-config-missing/none.toml");
        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());
    }
}
