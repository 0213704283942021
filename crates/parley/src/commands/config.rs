//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use parley_config::ParleyConfig;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Config file to use instead of discovery
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<ConfigCommand>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration as TOML (default)
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./parley.toml) instead of user config
        #[arg(long)]
        local: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Show => {
            let config = super::start::load(args.config.as_deref())?.resolved();
            if ctx.json_output {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
        }
        ConfigCommand::Which => {
            let loaded = parley_config::load_config(None)?;
            for (i, source) in loaded.sources.iter().enumerate() {
                let state = if source.loaded { "loaded" } else { "not found" };
                println!("{}. {} ({})", i + 1, source.path.display(), state);
            }
            for warning in &loaded.warnings {
                println!("warning: {}", warning);
            }
        }
        ConfigCommand::Init { local, force } => {
            let path = if local {
                PathBuf::from("parley.toml")
            } else {
                parley_config::xdg_config_path()
                    .ok_or_else(|| anyhow::anyhow!("no user config directory on this platform"))?
            };
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            parley_config::save_config(&ParleyConfig::new().resolved(), &path)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Path => match parley_config::xdg_config_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("no user config directory on this platform"),
        },
    }
    Ok(())
}
