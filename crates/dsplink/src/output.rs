//! Output formatting: text, JSON, plain.
//!
//! Renders values in the format selected by `--output`. Text is for people
//! and may carry color; JSON and plain are for scripts and never do.

use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use owo_colors::OwoColorize;
use serde::Serialize;

use dsplink_core::{DeviceAddress, ParamRef, ParamValue, Sample};

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
    }
}

/// Rendering settings shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    pub format: OutputFormat,
    pub color: bool,
}

#[derive(Serialize)]
struct ValueRecord<'a> {
    param: &'a ParamRef,
    value: &'a ParamValue,
}

#[derive(Serialize)]
struct ProbeRecord {
    device: String,
    reachable: bool,
    latency_ms: f64,
}

// ── Renderers ────────────────────────────────────────────────────────

pub fn render_value(style: Style, param: &ParamRef, value: &ParamValue) -> Result<String, CliError> {
    match style.format {
        OutputFormat::Text => Ok(if style.color {
            format!("{} = {}", param.cyan(), value.bold())
        } else {
            format!("{param} = {value}")
        }),
        OutputFormat::Plain => Ok(value.to_string()),
        OutputFormat::Json => render_json(&ValueRecord { param, value }, false),
        OutputFormat::JsonCompact => render_json(&ValueRecord { param, value }, true),
    }
}

pub fn render_sample(style: Style, sample: &Sample) -> Result<String, CliError> {
    match style.format {
        OutputFormat::Text => {
            let time = sample.received_at.format("%H:%M:%S%.3f");
            let mut line = if style.color {
                format!("{} {} {}", time.dimmed(), sample.param.cyan(), sample.value.bold())
            } else {
                format!("{time} {} {}", sample.param, sample.value)
            };
            if let Some(peak) = sample.peak {
                line.push_str(&format!(" peak {peak}"));
            }
            if sample.clip == Some(true) {
                if style.color {
                    line.push_str(&format!(" {}", "CLIP".red().bold()));
                } else {
                    line.push_str(" CLIP");
                }
            }
            Ok(line)
        }
        OutputFormat::Plain => Ok(format!("{} {}", sample.param, sample.value)),
        // Streams are line-oriented, so pretty JSON would break consumers.
        OutputFormat::Json | OutputFormat::JsonCompact => render_json(sample, true),
    }
}

pub fn render_probe(style: Style, address: &DeviceAddress, latency: Duration) -> Result<String, CliError> {
    let ms = latency.as_secs_f64() * 1000.0;
    let record = ProbeRecord {
        device: address.command_endpoint(),
        reachable: true,
        latency_ms: (ms * 100.0).round() / 100.0,
    };
    match style.format {
        OutputFormat::Text => Ok(if style.color {
            format!("{} {} in {ms:.1}ms", record.device, "reachable".green())
        } else {
            format!("{} reachable in {ms:.1}ms", record.device)
        }),
        OutputFormat::Plain => Ok(format!("{ms:.1}")),
        OutputFormat::Json => render_json(&record, false),
        OutputFormat::JsonCompact => render_json(&record, true),
    }
}

fn render_json<T: Serialize + ?Sized>(data: &T, compact: bool) -> Result<String, CliError> {
    Ok(if compact {
        serde_json::to_string(data)?
    } else {
        serde_json::to_string_pretty(data)?
    })
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}
