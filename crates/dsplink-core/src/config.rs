// ── Runtime device configuration ──
//
// These types describe *how* to talk to one device and how the registry
// manages clients. They never touch disk: dsplink-config (or any other
// host) builds them and hands them in.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use dsplink_api::{ChannelConfig, DeviceAddress, ParamRef};

/// Everything needed to build a [`DeviceClient`](crate::DeviceClient).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub address: DeviceAddress,
    /// Command channel tuning, including the optional password.
    pub channel: ChannelConfig,
    /// Local interface the telemetry port is bound on.
    pub telemetry_bind: IpAddr,
    /// Declared parameters. Empty means any well-formed name is accepted.
    pub catalog: Vec<ParamRef>,
}

impl DeviceConfig {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            channel: ChannelConfig::default(),
            telemetry_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            catalog: Vec::new(),
        }
    }
}

/// Client registry tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// How long an unreferenced client stays open. Default: 10 minutes.
    pub idle_timeout: Duration,
    /// Period of the background idle sweep. Default: 60s.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
