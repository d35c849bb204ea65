use clap::Parser;
use std::error::Error;
use std::path::PathBuf;

use rift_relay::RelayConfig;

#[derive(Parser)]
#[command(name = "rift-relay")]
#[command(about = "Pairs two peers that share a one-time code and relays bytes between them", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config_path: Option<PathBuf>,

    /// Port for the relay listener (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Port for the HTTP health check, 0 disables it (overrides the config file)
    #[arg(long)]
    health_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut config = RelayConfig::load(cli.config_path.as_deref()).await?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(health_port) = cli.health_port {
        config.health_port = health_port;
    }
    log::debug!("{:?}", config);

    rift_relay::commands::relay::run(config).await?;

    Ok(())
}
