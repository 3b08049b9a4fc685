//! Command-line interface for herald using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format for log aggregation.
    Json,
}

/// Notification rule matching and dispatch for bus messages.
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version)]
#[command(about = "Notification rule matching and dispatch for bus messages")]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Validate configuration and rules, then exit.
    #[arg(long = "validate")]
    pub validate: bool,

    /// Read newline-delimited JSON messages from this file instead of stdin.
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Log format: text or json.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,
}
