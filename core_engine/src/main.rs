use anyhow::{Context, Result};
use clap::Parser;
use shared_utils::config::Config;
use shared_utils::logging;
use shared_utils::tunnel::{TriggerRouter, TunnelManager};
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

mod signals;

#[derive(Parser, Debug)]
#[command(author, version, about = "TunnelKeeper daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "TUNNELKEEPER_CONFIG", default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> (Config, Option<String>) {
    let mut problem = None;
    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            problem = Some(format!(
                "Failed to load configuration from {}: {}; using defaults",
                args.config.display(),
                e
            ));
            Config::default()
        }
    };
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    (config, problem)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, problem) = load_config(&args);

    let _guard = logging::init_logging_from_config(&config);
    // Logging only exists once the config is known.
    if let Some(problem) = problem {
        warn!("{problem}");
    }

    info!("Starting TunnelKeeper daemon");

    let manager = TunnelManager::from_config(&config).await;
    manager
        .load()
        .await
        .context("Failed to load tunnel registry")?;

    let (router, router_task) = TriggerRouter::spawn(manager.clone());
    let forwarder = {
        let router = router.clone();
        tokio::spawn(async move { router.forward(signals::trigger_signals()).await })
    };

    // Boot replay honours the restore-on-boot flag.
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.restore_state(false).await {
                error!(error = %e, "Failed to restore tunnels on boot");
            }
        });
    }

    info!(tunnels = manager.tunnel_count(), "TunnelKeeper daemon started");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    forwarder.abort();
    drop(router);
    if let Err(e) = manager.save_state().await {
        error!(error = %e, "Failed to save running tunnels");
    }
    if let Err(e) = router_task.await {
        error!("Error waiting for trigger router to finish: {}", e);
    }

    info!("TunnelKeeper daemon shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let args = Args::parse_from([
            "tunnelkeeperd",
            "--config",
            "/nonexistent/tunnelkeeper.toml",
            "--log-level",
            "debug",
        ]);
        let (config, problem) = load_config(&args);
        assert!(problem.is_some());
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.workers, Config::default().workers);
    }
}
