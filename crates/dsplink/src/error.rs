//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and distinct exit codes.

use miette::Diagnostic;
use thiserror::Error;

use dsplink_config::ConfigError;
use dsplink_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const REJECTED: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Device at {device} is unreachable: {reason}")]
    #[diagnostic(
        code(dsplink::unreachable),
        help(
            "Check that the device is powered and on the network.\n\
             Try: dsplink probe -H {device}"
        )
    )]
    Unreachable { device: String, reason: String },

    #[error("Telemetry port {port} is already in use")]
    #[diagnostic(
        code(dsplink::port_in_use),
        help(
            "Another program (or another dsplink) is receiving telemetry on this port.\n\
             Stop it, or point this device at a different --telemetry-port."
        )
    )]
    PortInUse { port: u16 },

    #[error("Request timed out after {timeout}")]
    #[diagnostic(
        code(dsplink::timeout),
        help("Increase the timeout with --timeout or check device responsiveness.")
    )]
    Timeout { timeout: String },

    #[error("Too many requests queued ({depth})")]
    #[diagnostic(code(dsplink::overloaded), help("The device is not keeping up; retry shortly."))]
    Overloaded { depth: usize },

    // ── Device ───────────────────────────────────────────────────────
    #[error("Device rejected the request: {message}")]
    #[diagnostic(
        code(dsplink::rejected),
        help("The value may be out of range or the parameter read-only.")
    )]
    Rejected { message: String },

    #[error("Unknown parameter '{param}'")]
    #[diagnostic(
        code(dsplink::unknown_param),
        help("The device profile declares a catalog that does not list this parameter.")
    )]
    UnknownParameter { param: String },

    #[error("Unexpected reply from device: {message}")]
    #[diagnostic(code(dsplink::protocol))]
    Protocol { message: String },

    // ── Credentials ──────────────────────────────────────────────────
    #[error("No password available for device '{device}'")]
    #[diagnostic(
        code(dsplink::no_credentials),
        help(
            "Set password_env, keyring or password in the profile,\n\
             or pass --password / DSPLINK_PASSWORD."
        )
    )]
    NoCredentials { device: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(dsplink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Device profile '{name}' not found")]
    #[diagnostic(code(dsplink::profile_not_found), help("Available profiles: {available}"))]
    ProfileNotFound { name: String, available: String },

    #[error("No device selected")]
    #[diagnostic(
        code(dsplink::no_device),
        help(
            "Pass --host, name a profile with --device, or set default_device in\n\
             {path}"
        )
    )]
    NoDevice { path: String },

    #[error(transparent)]
    #[diagnostic(code(dsplink::config))]
    Config(ConfigError),

    // ── IO / Serialization ────────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render output: {0}")]
    #[diagnostic(code(dsplink::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unreachable { .. } | Self::PortInUse { .. } | Self::Overloaded { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Rejected { .. } => exit_code::REJECTED,
            Self::NoCredentials { .. } => exit_code::AUTH,
            Self::Validation { .. }
            | Self::UnknownParameter { .. }
            | Self::ProfileNotFound { .. }
            | Self::NoDevice { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Rejected { message } => Self::Rejected { message },
            CoreError::Unreachable { reason } => Self::Unreachable {
                device: "device".into(),
                reason,
            },
            CoreError::TelemetryPortInUse { port } => Self::PortInUse { port },
            CoreError::Timeout { timeout_ms } => Self::Timeout {
                timeout: humantime::format_duration(std::time::Duration::from_millis(timeout_ms)).to_string(),
            },
            CoreError::Overloaded { depth } => Self::Overloaded { depth },
            CoreError::UnknownParameter { param } => Self::UnknownParameter { param },
            CoreError::InvalidParameter { name, reason } => Self::Validation { field: name, reason },
            CoreError::Protocol { message } => Self::Protocol { message },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::ShutDown => Self::Unreachable {
                device: "device".into(),
                reason: "client registry is shut down".into(),
            },
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { device } => Self::NoCredentials { device },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}

impl CliError {
    /// Attach the device address to connection errors raised without one.
    pub fn for_device(self, device: &impl std::fmt::Display) -> Self {
        match self {
            Self::Unreachable { reason, .. } => Self::Unreachable {
                device: device.to_string(),
                reason,
            },
            other => other,
        }
    }
}
