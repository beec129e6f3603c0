//! Command handlers and the shared device session.

pub mod config_cmd;
pub mod param;
pub mod probe;
pub mod watch;

use dsplink_config::Config;
use dsplink_core::{ChannelState, ClientRegistry, DeviceClient, DeviceConfig, ParamRef};

use crate::cli::{Cli, Command, GlobalOpts};
use crate::config;
use crate::error::CliError;
use crate::output::{self, Style};

/// Route a command to its handler. Device commands resolve their target
/// from the config file and flags; config commands never connect.
pub async fn dispatch(cmd: Command, global: &GlobalOpts) -> Result<(), CliError> {
    let style = Style {
        format: global.output,
        color: output::should_color(global.color),
    };

    match cmd {
        Command::Config(args) => config_cmd::handle(&args, global, style),
        Command::Completions(args) => {
            use clap::CommandFactory;

            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "dsplink", &mut std::io::stdout());
            Ok(())
        }
        Command::Probe => {
            let (_, device) = target(global)?;
            probe::handle(&device, style, global).await
        }
        Command::Get(args) => {
            let session = Session::connect(global).await?;
            let result = param::get(&session.client, &args, style, global).await;
            session.close().await;
            result
        }
        Command::Set(args) => {
            let session = Session::connect(global).await?;
            let result = param::set(&session.client, &args, style, global).await;
            session.close().await;
            result
        }
        Command::Watch(args) => {
            let session = Session::connect(global).await?;
            let result = watch::handle(&session.client, &args, style, global).await;
            session.close().await;
            result
        }
    }
}

fn target(global: &GlobalOpts) -> Result<(Config, DeviceConfig), CliError> {
    let cfg = config::load(global)?;
    let device = config::resolve_device(global, &cfg)?;
    Ok((cfg, device))
}

/// One device client held through the registry for the life of a command.
pub struct Session {
    registry: ClientRegistry,
    client: DeviceClient,
}

impl Session {
    async fn connect(global: &GlobalOpts) -> Result<Self, CliError> {
        let (cfg, device) = target(global)?;
        tracing::debug!(device = %device.address, "opening session");
        Self::open(&cfg, &device).await
    }

    /// Connect and fail fast if the first attempt did not reach `Ready`.
    pub async fn open(cfg: &Config, device: &DeviceConfig) -> Result<Self, CliError> {
        let registry = ClientRegistry::new(cfg.registry_config());
        let client = match registry.acquire(device).await {
            Ok(client) => client,
            Err(e) => {
                registry.shutdown().await;
                return Err(CliError::from(e).for_device(&device.address));
            }
        };

        let status = client.status();
        if status.state != ChannelState::Ready {
            let reason = status.last_error.unwrap_or_else(|| format!("channel is {}", status.state));
            registry.shutdown().await;
            return Err(CliError::Unreachable {
                device: device.address.command_endpoint(),
                reason,
            });
        }

        Ok(Self { registry, client })
    }

    pub async fn close(self) {
        self.registry.release(self.client.address());
        self.registry.shutdown().await;
    }
}

pub(crate) fn parse_param(name: &str) -> Result<ParamRef, CliError> {
    name.parse::<ParamRef>().map_err(|e| CliError::Validation {
        field: "parameter".into(),
        reason: e.to_string(),
    })
}
