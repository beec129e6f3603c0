//! CLI-aware configuration: file loading plus `GlobalOpts` overrides.
//!
//! Profile parsing and credential resolution live in `dsplink-config`;
//! this module layers `--host`, `--password` and friends on top.

use std::path::PathBuf;

use secrecy::SecretString;

use dsplink_config::{Config, ConfigError, DeviceProfile};
use dsplink_core::DeviceConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Config file honoured by this invocation.
pub fn config_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(dsplink_config::config_path)
}

pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(dsplink_config::load_config_from(&config_path(global))?)
}

/// Build the device configuration for this invocation.
///
/// `--host` works without any config file; otherwise the profile named by
/// `--device` (or `default_device`) is used. Flags override the profile.
pub fn resolve_device(global: &GlobalOpts, cfg: &Config) -> Result<DeviceConfig, CliError> {
    let (name, mut profile) = match (&global.host, &global.device) {
        (Some(host), None) => (host.clone(), DeviceProfile::new(host.clone())),
        (host, name) => {
            let (name, profile) = cfg.device(name.as_deref()).map_err(|e| profile_error(e, global, cfg))?;
            let mut profile = profile.clone();
            if let Some(host) = host {
                profile.host.clone_from(host);
            }
            (name.to_owned(), profile)
        }
    };

    if let Some(port) = global.command_port {
        profile.command_port = port;
    }
    if let Some(port) = global.telemetry_port {
        profile.telemetry_port = port;
    }
    if global.password.is_some() {
        profile.password = None;
        profile.password_env = None;
        profile.keyring = false;
    }

    let mut device = dsplink_config::profile_to_device_config(&profile, &name, &cfg.defaults)?;
    if let Some(ref password) = global.password {
        device.channel.password = Some(SecretString::from(password.clone()));
    }
    if let Some(timeout) = global.timeout {
        device.channel.request_timeout = timeout;
    }

    tracing::debug!(device = %device.address, profile = %name, "resolved device");
    Ok(device)
}

fn profile_error(err: ConfigError, global: &GlobalOpts, cfg: &Config) -> CliError {
    match err {
        ConfigError::NoDevice => CliError::NoDevice {
            path: config_path(global).display().to_string(),
        },
        ConfigError::UnknownDevice { name } => {
            let available = if cfg.devices.is_empty() {
                "(none)".to_owned()
            } else {
                cfg.devices.keys().cloned().collect::<Vec<_>>().join(", ")
            };
            CliError::ProfileNotFound { name, available }
        }
        other => other.into(),
    }
}
