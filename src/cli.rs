//! CLI parsing.

use std::path::PathBuf;

use clap::Parser;

/// Slipway - single-node deployment platform
#[derive(Parser, Debug)]
#[command(name = "slipway")]
#[command(about = "Deploy git repositories as isolated, subdomain-routed services")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Path to settings file (default: ~/.slipway-settings.json)
    #[arg(short = 's', long = "settings")]
    pub settings: Option<PathBuf>,

    /// Proxy listen address, overriding the settings file
    #[arg(short = 'l', long = "listen")]
    pub listen: Option<String>,

    /// Skip restarting previously active projects at startup
    #[arg(long = "no-recover")]
    pub no_recover: bool,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the settings file path.
    pub fn get_settings_path(&self) -> Option<PathBuf> {
        self.settings.clone().or_else(crate::config::default_settings_path)
    }
}
