// dsplink-api: Async wire-level client for networked audio DSP appliances
//
// One device speaks two sockets: a TCP command connection carrying
// newline-delimited JSON requests and responses, and a UDP telemetry port
// the device pushes meter readings to. This crate owns both sockets and
// the framing; `dsplink-core` builds the multi-caller client on top.

pub mod codec;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod probe;
pub mod reconnect;
pub mod telemetry;
pub mod types;

pub use codec::{Inbound, RecordCodec, Request};
pub use command::{ChannelConfig, ChannelState, ChannelStatus, Command, CommandChannel};
pub use dispatch::{Dispatcher, Listener, ListenerId, SinkError, TelemetrySink};
pub use error::Error;
pub use probe::probe;
pub use reconnect::ReconnectConfig;
pub use telemetry::TelemetryChannel;
pub use types::{
    DEFAULT_COMMAND_PORT, DEFAULT_TELEMETRY_PORT, DeviceAddress, Method, ParamRef, ParamValue, Sample, SampleSource,
    ValueFormat,
};
