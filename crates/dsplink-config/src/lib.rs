//! Shared configuration for dsplink tools.
//!
//! TOML device profiles, credential resolution (env + keyring + plaintext),
//! and translation to `dsplink_core::DeviceConfig` / `RegistryConfig`.
//! The CLI layers its flag overrides on top of what this crate builds.

use std::collections::BTreeMap;
use std::net::IpAddr;
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

use dsplink_core::{
    ChannelConfig, DEFAULT_COMMAND_PORT, DEFAULT_TELEMETRY_PORT, DeviceAddress, DeviceConfig, ParamRef,
    ReconnectConfig, RegistryConfig,
};

const KEYRING_SERVICE: &str = "dsplink";
const REDACTED: &str = "********";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no device profile named '{name}'")]
    UnknownDevice { name: String },

    #[error("no device selected and no default_device configured")]
    NoDevice,

    #[error("no password available for device '{device}'")]
    NoCredentials { device: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when no device is named on the command line.
    pub default_device: Option<String>,

    /// Channel tuning applied to every device unless a profile overrides it.
    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub registry: RegistrySection,

    /// Named device profiles.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceProfile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Defaults {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_queue_depth: usize,
    pub max_in_flight: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Consecutive failures before the channel parks itself. Unset retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub long_sleep_secs: u64,
    /// Record terminator, e.g. "\n" or "\r\n".
    pub terminator: String,
    /// Local interface telemetry ports are bound on.
    pub telemetry_bind: IpAddr,
}

impl Default for Defaults {
    fn default() -> Self {
        let channel = ChannelConfig::default();
        Self {
            request_timeout_ms: millis(channel.request_timeout),
            connect_timeout_ms: millis(channel.connect_timeout),
            max_queue_depth: channel.max_queue_depth,
            max_in_flight: channel.max_in_flight,
            reconnect_initial_ms: millis(channel.reconnect.initial_delay),
            reconnect_max_ms: millis(channel.reconnect.max_delay),
            max_reconnect_attempts: channel.reconnect.max_attempts,
            long_sleep_secs: channel.reconnect.long_sleep.as_secs(),
            terminator: String::from_utf8_lossy(&channel.terminator).into_owned(),
            telemetry_bind: IpAddr::from([0, 0, 0, 0]),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrySection {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        Self {
            idle_timeout_secs: registry.idle_timeout.as_secs(),
            sweep_interval_secs: registry.sweep_interval.as_secs(),
        }
    }
}

/// A named device profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceProfile {
    /// Hostname or IP address of the appliance.
    pub host: String,

    #[serde(default = "default_command_port")]
    pub command_port: u16,

    #[serde(default = "default_telemetry_port")]
    pub telemetry_port: u16,

    /// Password (plaintext, prefer keyring or env var).
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,

    /// Look the password up in the system keyring.
    #[serde(default)]
    pub keyring: bool,

    /// Declared parameter names, e.g. "SourceGain_0".
    #[serde(default)]
    pub catalog: Vec<String>,

    /// Override the default request timeout.
    pub request_timeout_ms: Option<u64>,
}

fn default_command_port() -> u16 {
    DEFAULT_COMMAND_PORT
}
fn default_telemetry_port() -> u16 {
    DEFAULT_TELEMETRY_PORT
}

impl DeviceProfile {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            command_port: DEFAULT_COMMAND_PORT,
            telemetry_port: DEFAULT_TELEMETRY_PORT,
            password: None,
            password_env: None,
            keyring: false,
            catalog: Vec::new(),
            request_timeout_ms: None,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::with_ports(self.host.clone(), self.command_port, self.telemetry_port)
    }

    /// Whether any password source is configured.
    pub fn has_password_source(&self) -> bool {
        self.password.is_some() || self.password_env.is_some() || self.keyring
    }
}

impl Config {
    /// Pick a profile by name, falling back to `default_device`.
    pub fn device(&self, name: Option<&str>) -> Result<(&str, &DeviceProfile), ConfigError> {
        let name = name.or(self.default_device.as_deref()).ok_or(ConfigError::NoDevice)?;
        self.devices
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownDevice { name: name.into() })
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            idle_timeout: Duration::from_secs(self.registry.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.registry.sweep_interval_secs),
        }
    }

    /// Copy with plaintext passwords masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for profile in copy.devices.values_mut() {
            if profile.password.is_some() {
                profile.password = Some(REDACTED.into());
            }
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "dsplink", "dsplink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("dsplink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file. A missing file yields the defaults.
///
/// Environment variables override the file: `DSPLINK_DEFAULT_DEVICE`,
/// `DSPLINK_DEFAULTS__REQUEST_TIMEOUT_MS`, `DSPLINK_DEVICES__AMP__HOST`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DSPLINK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve a device password: env var → system keyring → plaintext.
///
/// Returns `Ok(None)` when the profile configures no password at all, and
/// [`ConfigError::NoCredentials`] when sources are configured but none
/// yields a value.
pub fn resolve_password(profile: &DeviceProfile, device: &str) -> Result<Option<SecretString>, ConfigError> {
    if !profile.has_password_source() {
        return Ok(None);
    }

    // 1. Profile's password_env → env var lookup
    if let Some(ref env_name) = profile.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(Some(SecretString::from(val)));
        }
    }

    // 2. System keyring
    if profile.keyring {
        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{device}/password")) {
            if let Ok(secret) = entry.get_password() {
                return Ok(Some(SecretString::from(secret)));
            }
        }
    }

    // 3. Plaintext in config
    if let Some(ref pw) = profile.password {
        return Ok(Some(SecretString::from(pw.clone())));
    }

    Err(ConfigError::NoCredentials { device: device.into() })
}

// ── Translation ─────────────────────────────────────────────────────

/// Build the channel tuning shared by every device from `[defaults]`.
pub fn channel_config(defaults: &Defaults) -> Result<ChannelConfig, ConfigError> {
    if defaults.terminator.is_empty() {
        return Err(ConfigError::Validation {
            field: "defaults.terminator".into(),
            reason: "must not be empty".into(),
        });
    }
    if defaults.max_queue_depth == 0 || defaults.max_in_flight == 0 {
        return Err(ConfigError::Validation {
            field: "defaults.max_queue_depth / max_in_flight".into(),
            reason: "must be at least 1".into(),
        });
    }
    if defaults.reconnect_initial_ms > defaults.reconnect_max_ms {
        return Err(ConfigError::Validation {
            field: "defaults.reconnect_initial_ms".into(),
            reason: format!(
                "{} exceeds reconnect_max_ms ({})",
                defaults.reconnect_initial_ms, defaults.reconnect_max_ms
            ),
        });
    }

    Ok(ChannelConfig {
        request_timeout: Duration::from_millis(defaults.request_timeout_ms),
        connect_timeout: Duration::from_millis(defaults.connect_timeout_ms),
        max_queue_depth: defaults.max_queue_depth,
        max_in_flight: defaults.max_in_flight,
        terminator: defaults.terminator.as_bytes().to_vec(),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(defaults.reconnect_initial_ms),
            max_delay: Duration::from_millis(defaults.reconnect_max_ms),
            max_attempts: defaults.max_reconnect_attempts,
            long_sleep: Duration::from_secs(defaults.long_sleep_secs),
        },
        ..ChannelConfig::default()
    })
}

/// Build a `DeviceConfig` from a profile, resolving its password.
pub fn profile_to_device_config(
    profile: &DeviceProfile,
    device: &str,
    defaults: &Defaults,
) -> Result<DeviceConfig, ConfigError> {
    if profile.host.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: format!("devices.{device}.host"),
            reason: "must not be empty".into(),
        });
    }

    let catalog = profile
        .catalog
        .iter()
        .map(|name| {
            name.parse::<ParamRef>().map_err(|e| ConfigError::Validation {
                field: format!("devices.{device}.catalog"),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut channel = channel_config(defaults)?;
    if let Some(ms) = profile.request_timeout_ms {
        channel.request_timeout = Duration::from_millis(ms);
    }
    channel.password = resolve_password(profile, device)?;

    Ok(DeviceConfig {
        channel,
        telemetry_bind: defaults.telemetry_bind,
        catalog,
        ..DeviceConfig::new(profile.address())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();

        assert!(config.devices.is_empty());
        assert_eq!(config.defaults.request_timeout_ms, 5000);
        assert_eq!(config.defaults.max_queue_depth, 50);
        assert_eq!(config.registry.idle_timeout_secs, 600);
        assert!(matches!(config.device(None), Err(ConfigError::NoDevice)));
    }

    #[test]
    fn profiles_load_with_port_defaults() {
        let file = write_config(
            r#"
default_device = "amp"

[defaults]
request_timeout_ms = 2500
terminator = "\r\n"

[registry]
idle_timeout_secs = 120

[devices.amp]
host = "10.0.0.20"
catalog = ["SourceGain_0", "ZoneGain_3"]

[devices.rack]
host = "dsp-rack.local"
command_port = 6000
"#,
        );
        let config = load_config_from(file.path()).unwrap();

        let (name, amp) = config.device(None).unwrap();
        assert_eq!(name, "amp");
        assert_eq!(amp.command_port, DEFAULT_COMMAND_PORT);
        assert_eq!(amp.telemetry_port, DEFAULT_TELEMETRY_PORT);

        let (_, rack) = config.device(Some("rack")).unwrap();
        assert_eq!(rack.command_port, 6000);
        assert!(matches!(
            config.device(Some("nope")),
            Err(ConfigError::UnknownDevice { name }) if name == "nope"
        ));

        let device = profile_to_device_config(amp, name, &config.defaults).unwrap();
        assert_eq!(device.address.to_string(), "10.0.0.20:5321/:3131");
        assert_eq!(device.channel.request_timeout, Duration::from_millis(2500));
        assert_eq!(device.channel.terminator, b"\r\n".to_vec());
        assert_eq!(device.catalog.len(), 2);
        assert!(device.channel.password.is_none());

        assert_eq!(config.registry_config().idle_timeout, Duration::from_secs(120));
        assert_eq!(config.registry_config().sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn plaintext_password_is_resolved_and_redacted() {
        let file = write_config(
            r#"
[devices.amp]
host = "10.0.0.20"
password = "hunter2"
"#,
        );
        let config = load_config_from(file.path()).unwrap();
        let (name, amp) = config.device(Some("amp")).unwrap();

        let secret = resolve_password(amp, name).unwrap().unwrap();
        assert_eq!(secret.expose_secret(), "hunter2");

        let shown = config.redacted().to_toml().unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains(REDACTED));
    }

    #[test]
    fn unset_password_env_without_fallback_is_an_error() {
        let mut profile = DeviceProfile::new("10.0.0.20");
        profile.password_env = Some("DSPLINK_TEST_PASSWORD_THAT_IS_NEVER_SET".into());

        assert!(matches!(
            resolve_password(&profile, "amp"),
            Err(ConfigError::NoCredentials { device }) if device == "amp"
        ));

        profile.password = Some("fallback".into());
        let secret = resolve_password(&profile, "amp").unwrap().unwrap();
        assert_eq!(secret.expose_secret(), "fallback");
    }

    #[test]
    fn invalid_catalog_entry_is_rejected() {
        let mut profile = DeviceProfile::new("10.0.0.20");
        profile.catalog = vec!["SourceGain".into()];

        let err = profile_to_device_config(&profile, "amp", &Defaults::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "devices.amp.catalog"));
    }

    #[test]
    fn inconsistent_defaults_are_rejected() {
        let defaults = Defaults {
            terminator: String::new(),
            ..Defaults::default()
        };
        assert!(channel_config(&defaults).is_err());

        let defaults = Defaults {
            reconnect_initial_ms: 60_000,
            reconnect_max_ms: 1_000,
            ..Defaults::default()
        };
        assert!(channel_config(&defaults).is_err());
    }

    #[test]
    fn default_channel_matches_library_defaults() {
        let channel = channel_config(&Defaults::default()).unwrap();
        let library = ChannelConfig::default();

        assert_eq!(channel.request_timeout, library.request_timeout);
        assert_eq!(channel.max_in_flight, library.max_in_flight);
        assert_eq!(channel.terminator, library.terminator);
        assert_eq!(channel.reconnect, library.reconnect);
    }
}
