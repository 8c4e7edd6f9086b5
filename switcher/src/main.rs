// Chain Switcher daemon
//
// Samples difficulty on every tracked chain, points the GPU miner at the
// most profitable one and restarts it through systemd.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use chain_switcher::{
    ChainSwitcher, CycleOutcome, DifficultyTracker, JsonFileStore, NodeRpcClient, SwitcherSettings,
    SystemdMinerControl,
};

#[derive(Parser, Debug)]
#[command(
    name = "chain-switcher",
    version,
    about = "Profitability-driven chain switching for an external GPU miner",
    long_about = None
)]
struct Cli {
    /// Settings file (JSON). Defaults to $SWITCHER_CONFIG, then ./switcher.json
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single decision cycle, print the status and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let settings = SwitcherSettings::load(cli.config.as_deref()).context("loading switcher settings")?;

    let source = Arc::new(NodeRpcClient::new(&settings.rpc));
    let tracker = DifficultyTracker::new(source, settings.chains.clone(), settings.history_capacity);
    let store = Arc::new(JsonFileStore::new(settings.miner_config_path.clone()));
    let miner = Arc::new(SystemdMinerControl::new(&settings.miner_service));
    let switcher = ChainSwitcher::new(tracker, store, miner, &settings);

    tracing::info!(
        chains = settings.chains.len(),
        miner_config = %settings.miner_config_path.display(),
        unit = %settings.miner_service.unit,
        "⛓️  chain switcher ready"
    );

    if cli.once {
        match switcher.check_and_switch().await? {
            CycleOutcome::Switched(record) => {
                tracing::info!(chain = %record.chain, "switched");
            }
            other => tracing::info!(outcome = ?other, "no switch"),
        }
        println!("{}", serde_json::to_string_pretty(&switcher.get_status())?);
        return Ok(());
    }

    switcher.start();

    let shutdown_signal = async {
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot register SIGTERM handler, waiting for Ctrl+C");
                    tokio::signal::ctrl_c().await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Ctrl+C received, shutting down");
        }
    };
    shutdown_signal.await;

    switcher.stop();
    let status = switcher.get_status();
    tracing::info!(
        current = ?status.current_chain,
        switches = status.recent_switches.len(),
        "🏁 chain switcher shut down cleanly"
    );
    Ok(())
}
