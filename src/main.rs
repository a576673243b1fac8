use clap::Parser;
use spreadsheet_worker::{CliArgs, LoggingConfig, init_logging, run_cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logging_config = LoggingConfig::from_env();
    let _guard = init_logging(logging_config)?;

    let cli = CliArgs::parse();
    run_cli(cli).await
}
