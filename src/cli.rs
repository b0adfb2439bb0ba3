// CLI module - command-line argument parsing
//
// Flags override the loaded configuration. The `config` subcommand prints
// the effective configuration as TOML and exits without booting.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// companion - captures prompts, code changes and terminal activity
#[derive(Parser, Debug)]
#[command(name = "companion")]
#[command(version = VERSION)]
#[command(about = "Local capture service for AI-assisted coding sessions", long_about = None)]
pub struct Cli {
    /// Config file (TOML, or JSON with a .json extension)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// HTTP port on 127.0.0.1
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory tree to watch for code changes
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Do not start the file watcher
    #[arg(long)]
    pub no_watch: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration (env > file > defaults) as TOML
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },
}

impl Cli {
    /// Apply flag overrides on top of the loaded config
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = &self.root {
            config.root_dir = root.clone();
        }
        if self.no_watch {
            config.watch = false;
        }
    }
}

/// Handle a subcommand. Returns true if one ran (exit after).
pub fn handle_command(cli: &Cli, config: &Config) -> bool {
    match &cli.command {
        Some(Commands::Config { path: true }) => {
            match Config::resolve_path(cli.config.as_deref()) {
                Some(path) => println!("{}", path.display()),
                None => println!("(no config path: home directory unknown)"),
            }
            true
        }
        Some(Commands::Config { path: false }) => {
            match &config.source {
                Some(path) => println!("# Source: {}", path.display()),
                None => println!("# Source: defaults (no config file)"),
            }
            print!("{}", config.to_toml());
            true
        }
        None => false,
    }
}
