//! `dsplink probe`: TCP reachability check, no protocol traffic.

use std::time::Duration;

use dsplink_core::{CoreError, DeviceConfig};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output::{self, Style};

pub async fn handle(device: &DeviceConfig, style: Style, global: &GlobalOpts) -> Result<(), CliError> {
    let timeout = global.timeout.unwrap_or(device.channel.connect_timeout);
    let latency: Duration = dsplink_core::probe(&device.address, timeout)
        .await
        .map_err(|e| CliError::from(CoreError::from(e)).for_device(&device.address.command_endpoint()))?;

    output::print_output(&output::render_probe(style, &device.address, latency)?, global.quiet);
    Ok(())
}
