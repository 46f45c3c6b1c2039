//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tool health monitor with circuit breaking, fallback and alerting
#[derive(Parser, Debug)]
#[command(name = "toolguard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOLGUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port for the dashboard server
    #[arg(short, long, env = "TOOLGUARD_PORT")]
    pub port: Option<u16>,

    /// Host to bind the dashboard server to
    #[arg(long, env = "TOOLGUARD_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TOOLGUARD_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOLGUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the monitor and its dashboard (default)
    Serve,

    /// Validate a configuration file and print the resolved tool table
    CheckConfig {
        /// Path to configuration YAML file
        #[arg(required = true)]
        file: PathBuf,
    },
}
