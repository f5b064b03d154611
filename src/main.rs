use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt};

use tranche::AppConfig;
use tranche::engine::BacktestEngine;

#[derive(Parser)]
#[command(name = "tranche", version, about = "Multi-algorithm trading runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay candle history through every configured algorithm
    Backtest {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file
    Check {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = match &cli.command {
        Command::Backtest { config } | Command::Check { config } => config.clone(),
    };
    let config = AppConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tranche={}", config.app.log_level, config.app.log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    match cli.command {
        Command::Check { .. } => {
            tracing::info!(
                mode = %config.app.mode,
                algorithms = config.algorithms.len(),
                "Configuration is valid"
            );
        }
        Command::Backtest { .. } => {
            tracing::info!("Tranche backtest starting...");
            let engine = BacktestEngine::from_config(&config).await?;
            let report = tokio::task::spawn_blocking(move || engine.run()).await??;

            for (algorithm, portfolio) in &report.portfolios {
                tracing::info!(%algorithm, portfolio = %portfolio.to_json(), "Final allocation");
            }
            for (algorithm, value) in &report.valuations {
                tracing::info!(%algorithm, %value, base = %report.base_currency, "Final value");
            }
            for (asset, fee) in report.fees() {
                tracing::info!(%asset, %fee, "Fees paid");
            }
            for algorithm in &report.halted {
                tracing::warn!(%algorithm, "Algorithm halted during replay");
            }
            if let Some(backtest) = &config.backtest {
                tracing::info!(
                    trades = report.ledger.len(),
                    ledger = %backtest.output.display(),
                    "Backtest complete"
                );
            }
        }
    }

    Ok(())
}
