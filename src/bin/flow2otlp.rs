use clap::Parser;
use flow2otlp::cli::{execute_run, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    flow2otlp::native::init_tracing(cli.log_json);
    execute_run(cli).await
}
