// ── Core error types ──
//
// Caller-facing errors from dsplink-core. The central split is between
// the hardware refusing a request (`Rejected`) and the hardware not being
// reachable at all (`Unreachable` and friends); UI layers key their
// messages off `is_rejected()` / `is_unreachable()`.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Device answered ──────────────────────────────────────────────
    #[error("Device rejected the request: {message}")]
    Rejected { message: String },

    // ── Device not reachable ─────────────────────────────────────────
    #[error("Device unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Telemetry port {port} is already in use")]
    TelemetryPortInUse { port: u16 },

    #[error("Device did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Too many requests waiting for the device ({depth} queued)")]
    Overloaded { depth: usize },

    // ── Caller errors ────────────────────────────────────────────────
    #[error("Unknown parameter '{param}' (not declared for this device)")]
    UnknownParameter { param: String },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    // ── Data / configuration ─────────────────────────────────────────
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Client registry has been shut down")]
    ShutDown,
}

impl CoreError {
    /// The device understood the request and refused it.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The device could not be talked to at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::TelemetryPortInUse { .. } | Self::Timeout { .. } | Self::ShutDown
        )
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<dsplink_api::Error> for CoreError {
    fn from(err: dsplink_api::Error) -> Self {
        use dsplink_api::Error as Api;

        match err {
            Api::Device { message } => Self::Rejected { message },
            Api::PortInUse { port } => Self::TelemetryPortInUse { port },
            Api::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            Api::Overloaded { depth } => Self::Overloaded { depth },
            Api::ChannelLost => Self::Unreachable {
                reason: "connection to the device was lost".into(),
            },
            Api::ChannelClosed => Self::Unreachable {
                reason: "device client has been closed".into(),
            },
            e @ (Api::Connection { .. } | Api::Authentication { .. } | Api::Io(_)) => Self::Unreachable {
                reason: e.to_string(),
            },
            Api::Protocol { message, raw } => Self::Protocol {
                message: format!("{message} (raw: {raw})"),
            },
            Api::InvalidParam { name, reason } => Self::InvalidParameter { name, reason },
            Api::InvalidAddress { input, reason } => Self::Config {
                message: format!("invalid device address '{input}': {reason}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_maps_to_rejected() {
        let err = CoreError::from(dsplink_api::Error::Device {
            message: "gain out of range".into(),
        });
        assert!(err.is_rejected());
        assert!(!err.is_unreachable());
        assert_eq!(err.to_string(), "Device rejected the request: gain out of range");
    }

    #[test]
    fn channel_lost_maps_to_unreachable() {
        let err = CoreError::from(dsplink_api::Error::ChannelLost);
        assert!(err.is_unreachable());
        assert!(!err.is_rejected());
    }

    #[test]
    fn port_in_use_keeps_the_port() {
        let err = CoreError::from(dsplink_api::Error::PortInUse { port: 3131 });
        assert!(matches!(err, CoreError::TelemetryPortInUse { port: 3131 }));
        assert!(err.is_unreachable());
    }

    #[test]
    fn unknown_parameter_is_neither() {
        let err = CoreError::UnknownParameter {
            param: "Bogus_0".into(),
        };
        assert!(!err.is_rejected());
        assert!(!err.is_unreachable());
    }
}
