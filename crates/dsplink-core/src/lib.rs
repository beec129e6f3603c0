// dsplink-core: Shared device clients between dsplink-api and consumers (CLI, services).

pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod state;
pub mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::{ClientContext, DeviceClient};
pub use config::{DeviceConfig, RegistryConfig};
pub use error::CoreError;
pub use registry::ClientRegistry;
pub use state::{ConnectionStateRecord, ConnectionStateStore, InMemoryStateStore};
pub use subscription::SubscriptionHandle;

// Wire types callers need alongside the client API.
pub use dsplink_api::{
    ChannelConfig, ChannelState, ChannelStatus, DEFAULT_COMMAND_PORT, DEFAULT_TELEMETRY_PORT, DeviceAddress, ParamRef,
    ParamValue, ReconnectConfig, Sample, SampleSource, SinkError, TelemetrySink, ValueFormat, probe,
};
