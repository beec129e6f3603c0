use thiserror::Error;

/// Top-level error type for the `dsplink-api` crate.
///
/// Covers every failure mode of the wire layer: connection establishment,
/// in-flight request lifecycle, device-side rejections, and malformed data.
/// `dsplink-core` maps these into caller-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// Socket-level failure while establishing the command connection.
    #[error("Cannot connect to device at {address}: {reason}")]
    Connection { address: String, reason: String },

    /// The local telemetry port is already bound (by this process or another).
    #[error("Telemetry port {port} is already in use")]
    PortInUse { port: u16 },

    /// The connection dropped while the request was outstanding.
    #[error("Channel lost -- device connection dropped")]
    ChannelLost,

    /// The channel was explicitly closed and accepts no more work.
    #[error("Channel closed")]
    ChannelClosed,

    /// Too many requests are already queued waiting for the channel.
    #[error("Channel overloaded -- {depth} requests already queued")]
    Overloaded { depth: usize },

    /// The device refused the configured credentials.
    #[error("Authentication rejected by device: {message}")]
    Authentication { message: String },

    // ── Request ─────────────────────────────────────────────────────
    /// No matching response arrived within the request deadline.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Well-formed error response from the hardware.
    #[error("Device rejected request: {message}")]
    Device { message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A record could not be decoded, with the raw bytes for debugging.
    #[error("Protocol error: {message}")]
    Protocol { message: String, raw: String },

    /// A parameter name does not follow the `<category>_<index>` form.
    #[error("Invalid parameter name '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    /// A device address string could not be parsed.
    #[error("Invalid device address '{input}': {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Overloaded { .. } | Self::ChannelLost | Self::Connection { .. }
        )
    }

    /// Returns `true` if this error means the device is unreachable, as
    /// opposed to the device answering with a rejection.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::PortInUse { .. }
                | Self::ChannelLost
                | Self::ChannelClosed
                | Self::Authentication { .. }
                | Self::Io(_)
        )
    }

    pub(crate) fn connection(address: impl ToString, reason: impl ToString) -> Self {
        Self::Connection {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}
