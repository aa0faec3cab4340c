use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};

use super::Cli;
use crate::config::{load_config_from_path, Config};
use crate::pipeline::Pipeline;
use crate::sink::{HttpSink, HttpSinkConfig};
use crate::source::JsonLinesSource;

type Input = Box<dyn AsyncBufRead + Unpin + Send>;

/// Resolve the configuration: file first, then command line overrides.
pub(crate) fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => load_config_from_path(path)?,
        None => Config::default(),
    };

    if let Some(endpoint) = &cli.endpoint {
        match config.sink.as_mut() {
            Some(sink) => sink.endpoint = endpoint.clone(),
            None => config.sink = Some(HttpSinkConfig::new(endpoint.clone())),
        }
    }
    if let Some(token) = &cli.token {
        match config.sink.as_mut() {
            Some(sink) => sink.token = Some(token.clone()),
            None => warn!("token given without a sink endpoint, ignoring"),
        }
    }
    if let Some(buffer_size) = cli.buffer_size {
        config.buffer_size = buffer_size;
    }
    if let Some(signal) = cli.signal {
        config.signal = signal;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn open_input(input: &str) -> Result<Input> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Stream the input through the pipeline until it ends or Ctrl-C.
pub async fn execute_run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let Some(sink_config) = config.sink.clone() else {
        bail!("No sink endpoint configured. Set [sink] endpoint in the config or pass --endpoint");
    };

    let converter = config.build_converter()?;
    let sink = Arc::new(HttpSink::new(sink_config)?);
    let source = JsonLinesSource::new(
        open_input(&cli.input).await?,
        config.schema.root_type.clone(),
        config.schema.type_field.clone(),
    )
    .with_registry(config.registry());

    info!(
        input = %cli.input,
        endpoint = %sink.endpoint(),
        signal = %config.signal,
        encoding = config.stream(config.signal).encoding.encoding.as_str(),
        "starting flow export"
    );

    let handle = Pipeline::new(source, converter, sink, config.buffer_size)?
        .with_partial_batch_policy(config.partial_batch)
        .spawn();

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    let report = handle.join().await;
    info!(
        converted = report.converted,
        exported = report.exported,
        "flow export finished"
    );
    if let Some(err) = report.fatal_errors().next() {
        bail!("Pipeline stopped: {}", err);
    }
    Ok(())
}
