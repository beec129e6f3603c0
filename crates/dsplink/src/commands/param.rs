//! `dsplink get` / `dsplink set`.

use dsplink_core::{DeviceClient, ParamValue};

use crate::cli::{GetArgs, GlobalOpts, SetArgs};
use crate::error::CliError;
use crate::output::{self, Style};

use super::parse_param;

pub async fn get(client: &DeviceClient, args: &GetArgs, style: Style, global: &GlobalOpts) -> Result<(), CliError> {
    // Validate every name before touching the device.
    let params = args
        .params
        .iter()
        .map(|name| parse_param(name))
        .collect::<Result<Vec<_>, _>>()?;

    for param in &params {
        let value = client.get(param).await?;
        output::print_output(&output::render_value(style, param, &value)?, global.quiet);
    }
    Ok(())
}

pub async fn set(client: &DeviceClient, args: &SetArgs, style: Style, global: &GlobalOpts) -> Result<(), CliError> {
    let param = parse_param(&args.param)?;
    let requested = ParamValue::parse_lenient(&args.value);

    let ack = client.set(&param, requested.clone()).await?;
    // Devices may answer with a bare `true`; show what was written then.
    let shown = if ack.is_null() || (ack.as_bool() == Some(true) && requested.as_bool().is_none()) {
        requested
    } else {
        ack
    };
    output::print_output(&output::render_value(style, &param, &shown)?, global.quiet);
    Ok(())
}
