//! Clap derive structures for the `dsplink` CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use dsplink_core::ValueFormat;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// dsplink -- talk to networked audio DSP appliances
#[derive(Debug, Parser)]
#[command(
    name = "dsplink",
    version,
    about = "Read, write and watch parameters on networked DSP appliances",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Device profile to use
    #[arg(long, short = 'd', env = "DSPLINK_DEVICE", global = true)]
    pub device: Option<String>,

    /// Device host or IP (overrides profile)
    #[arg(long, short = 'H', env = "DSPLINK_HOST", global = true)]
    pub host: Option<String>,

    /// TCP command port (overrides profile)
    #[arg(long, global = true)]
    pub command_port: Option<u16>,

    /// UDP telemetry port (overrides profile)
    #[arg(long, global = true)]
    pub telemetry_port: Option<u16>,

    /// Device password
    #[arg(long, env = "DSPLINK_PASSWORD", global = true, hide_env_values = true)]
    pub password: Option<String>,

    /// Alternate config file
    #[arg(long, env = "DSPLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Request timeout, e.g. "5s" or "750ms"
    #[arg(long, short = 't', global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Output format
    #[arg(long, short = 'o', env = "DSPLINK_OUTPUT", default_value = "text", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines (default)
    Text,
    /// Pretty-printed JSON
    Json,
    /// One compact JSON object per line
    JsonCompact,
    /// Bare values, one per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

/// Value representation requested from the device.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum FormatArg {
    /// Engineering value (dB, raw level)
    #[default]
    Val,
    /// Normalised 0-100 position
    Pct,
    /// Device-formatted text
    Str,
}

impl From<FormatArg> for ValueFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Val => Self::Value,
            FormatArg::Pct => Self::Percent,
            FormatArg::Str => Self::Text,
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the device accepts connections
    Probe,

    /// Read one or more parameters
    Get(GetArgs),

    /// Write a parameter
    Set(SetArgs),

    /// Stream live values until interrupted
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Inspect configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Parameter names, e.g. SourceGain_0
    #[arg(required = true)]
    pub params: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// Parameter name, e.g. SourceGain_0
    pub param: String,

    /// New value; JSON literals (-12.5, true, "text") or bare text
    #[arg(allow_hyphen_values = true)]
    pub value: String,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Parameter names, e.g. InputMeter_0
    #[arg(required = true)]
    pub params: Vec<String>,

    /// Value format to subscribe to
    #[arg(long, short = 'f', default_value = "val")]
    pub format: FormatArg,

    /// Stop after this long, e.g. "30s"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Stop after this many samples
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,
    /// Print the effective configuration, passwords masked
    Show,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    pub shell: clap_complete::Shell,
}
