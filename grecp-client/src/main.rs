use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod runtime;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            let cfg = grecp_core::config::ClientConfig::default();
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Run => {
            let cfg = config::load(&config_path)?;
            init_logging(&cfg.log_level);
            tracing::info!("Loaded config from {}", config_path.display());

            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            runtime::run_client(cfg, stop_rx).await
        }
    }
}
