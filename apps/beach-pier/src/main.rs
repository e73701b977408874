use anyhow::Result;
use beach_pier::{
    cli::{Cli, Commands},
    config::ServerConfig,
    probe, server,
    telemetry::Telemetry,
};
use clap::Parser;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    if let Some(Commands::Probe { url, timeout_secs }) = cli.command {
        return probe::run_probe(&url, Duration::from_secs(timeout_secs)).await;
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        connection_buffer = config.connection_buffer,
        notify_peer_left = config.switchboard.notify_peer_left,
        queue_timeout_secs = ?config.switchboard.queue_timeout.map(|t| t.as_secs()),
        "starting beach-pier"
    );

    server::run(config, telemetry.metrics_handle()).await
}
