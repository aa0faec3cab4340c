mod run;

use std::path::PathBuf;

use clap::Parser;

use crate::config::Signal;

pub use run::execute_run;

#[derive(Parser, Debug)]
#[command(name = "flow2otlp")]
#[command(about = "Convert flow events into OpenTelemetry log records and export them in batches")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// NDJSON event file, `-` reads stdin
    #[arg(long, short = 'i', default_value = "-")]
    pub input: String,

    /// Collector endpoint, overrides `sink.endpoint`
    #[arg(long, env = "FLOW2OTLP_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Bearer token, overrides `sink.token`
    #[arg(long, env = "FLOW2OTLP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Overrides `buffer_size`
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Stream to produce, overrides `signal`
    #[arg(long, value_enum)]
    pub signal: Option<Signal>,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,
}
