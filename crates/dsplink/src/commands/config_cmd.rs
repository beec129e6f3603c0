//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::config;
use crate::error::CliError;
use crate::output::{self, Style};

pub fn handle(args: &ConfigArgs, global: &GlobalOpts, style: Style) -> Result<(), CliError> {
    match args.command {
        // ── Path ────────────────────────────────────────────────────
        ConfigCommand::Path => {
            let path = config::config_path(global);
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }

        // ── Show ────────────────────────────────────────────────────
        ConfigCommand::Show => {
            let cfg = config::load(global)?.redacted();
            let out = match style.format {
                OutputFormat::Text | OutputFormat::Plain => cfg.to_toml()?,
                OutputFormat::Json => serde_json::to_string_pretty(&cfg)?,
                OutputFormat::JsonCompact => serde_json::to_string(&cfg)?,
            };
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }
    }
}
