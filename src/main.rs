use anyhow::Result;
use clap::Parser;
use stationmail::cli::{Cli, CliHandler};
use stationmail::config::MailConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set log level based on debug flag
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .init();

    let config = MailConfig::load(cli.config_dir.as_deref()).await?;
    let handler = CliHandler::new(config, cli.data_dir).await?;
    handler.handle_command(cli.command).await
}
