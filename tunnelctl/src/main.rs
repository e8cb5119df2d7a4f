use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use shared_utils::config::Config;
use shared_utils::logging::{LogOptions, init_logging};
use shared_utils::tunnel::{Tunnel, TunnelConfig, TunnelManager, TunnelSnapshot, TunnelState};
use std::path::PathBuf;
use tracing::info;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  tunnelctl list --output json\n  tunnelctl create home --file home.conf\n  tunnelctl up home\n  tunnelctl restore --force")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "TUNNELKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "warn",
        env = "TUNNELKEEPER_LOG_LEVEL"
    )]
    log_level: LogLevelArg,

    /// Emit logs as JSON
    #[arg(long, env = "TUNNELKEEPER_JSON_LOGS")]
    json_logs: bool,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all tunnels
    List,
    /// Show one tunnel, including its configuration and statistics
    Show { name: String },
    /// Store a new tunnel configuration
    Create {
        name: String,
        /// Configuration file to import
        #[arg(long)]
        file: PathBuf,
    },
    /// Delete a tunnel, bringing it down first
    Delete { name: String },
    /// Rename a tunnel
    Rename { name: String, new_name: String },
    /// Bring a tunnel up
    Up { name: String },
    /// Bring a tunnel down
    Down { name: String },
    /// Bring back the tunnels that were running at the last save
    Restore {
        /// Restore even if restore-on-boot is disabled
        #[arg(long)]
        force: bool,
    },
    /// Re-read every tunnel's state from the backend
    Refresh,
    /// Bring every running tunnel down
    DownAll,
    /// Show or change the restore-on-boot flag
    RestoreOnBoot {
        #[arg(value_enum)]
        switch: Option<Switch>,
    },
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: &'a str,
}

fn print_msg(fmt: OutputFormat, status: &str, detail: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{status}: {detail}"),
        OutputFormat::Json => {
            let msg = Message { status, detail };
            println!("{}", serde_json::to_string_pretty(&msg)?);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Row {
    name: String,
    state: TunnelState,
    last_used: bool,
}

fn print_tunnels(fmt: OutputFormat, tunnels: &[Tunnel], last_used: Option<&Tunnel>) -> Result<()> {
    let rows: Vec<Row> = tunnels
        .iter()
        .map(|t| Row {
            name: t.name(),
            state: t.state(),
            last_used: last_used == Some(t),
        })
        .collect();
    match fmt {
        OutputFormat::Table => {
            println!("{:<16} {:<6} LAST", "NAME", "STATE");
            for row in &rows {
                let marker = if row.last_used { "*" } else { "" };
                println!("{:<16} {:<6} {}", row.name, row.state, marker);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

fn print_snapshot(fmt: OutputFormat, snapshot: &TunnelSnapshot) -> Result<()> {
    match fmt {
        OutputFormat::Table => {
            println!("name:  {}", snapshot.name);
            println!("state: {}", snapshot.state);
            if let Some(stats) = &snapshot.statistics {
                println!("rx:    {} bytes", stats.total_rx());
                println!("tx:    {} bytes", stats.total_tx());
                for (peer, peer_stats) in stats.peers() {
                    println!("  peer {peer}: rx {} tx {}", peer_stats.rx_bytes, peer_stats.tx_bytes);
                }
            }
            if let Some(config) = &snapshot.config {
                println!();
                println!("{config}");
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(snapshot)?),
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display())),
        None => {
            let path = Config::default_path();
            if path.exists() {
                Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn find(manager: &TunnelManager, name: &str) -> Result<Tunnel> {
    match manager.get(name) {
        Some(tunnel) => Ok(tunnel),
        None => bail!("No tunnel named {name}"),
    }
}

async fn run(args: Args, manager: TunnelManager) -> Result<()> {
    let out = args.output;
    match args.command {
        Command::List => {
            let tunnels = manager.tunnels().await;
            print_tunnels(out, &tunnels, manager.last_used().as_ref())?;
        }
        Command::Show { name } => {
            let tunnel = find(&manager, &name)?;
            manager.load_config(&tunnel).await?;
            if tunnel.state().is_up() {
                manager.refresh_statistics(&tunnel).await?;
            }
            print_snapshot(out, &tunnel.snapshot())?;
        }
        Command::Create { name, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            manager.create(&name, TunnelConfig::new(text)).await?;
            print_msg(out, "ok", &format!("created {name}"))?;
        }
        Command::Delete { name } => {
            let tunnel = find(&manager, &name)?;
            manager.delete(&tunnel).await?;
            print_msg(out, "ok", &format!("deleted {name}"))?;
        }
        Command::Rename { name, new_name } => {
            let tunnel = find(&manager, &name)?;
            let renamed = manager.rename(&tunnel, &new_name).await?;
            print_msg(out, "ok", &format!("renamed {name} to {renamed}"))?;
        }
        Command::Up { name } => {
            let tunnel = find(&manager, &name)?;
            let state = manager.set_state(&tunnel, TunnelState::Up).await?;
            print_msg(out, "ok", &format!("{name} is {state}"))?;
        }
        Command::Down { name } => {
            let tunnel = find(&manager, &name)?;
            let state = manager.set_state(&tunnel, TunnelState::Down).await?;
            print_msg(out, "ok", &format!("{name} is {state}"))?;
        }
        Command::Restore { force } => {
            manager.restore_state(force).await?;
            print_msg(out, "ok", "restored saved tunnels")?;
        }
        Command::Refresh => {
            manager.refresh_tunnel_states().await?;
            let tunnels = manager.tunnels().await;
            print_tunnels(out, &tunnels, manager.last_used().as_ref())?;
        }
        Command::DownAll => {
            manager.set_all_down().await?;
            print_msg(out, "ok", "all tunnels down")?;
        }
        Command::RestoreOnBoot { switch } => {
            if let Some(switch) = switch {
                manager.set_restore_on_boot(switch == Switch::On).await?;
            }
            let enabled = manager.restore_on_boot().await?;
            print_msg(out, "ok", if enabled { "restore on boot: on" } else { "restore on boot: off" })?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level: tracing::Level = args.log_level.into();
    let _guard = init_logging(LogOptions {
        level,
        json_format: args.json_logs,
        ..Default::default()
    });

    let config = load_config(args.config.as_ref())?;
    let manager = TunnelManager::from_config(&config).await;
    manager.load().await.context("Failed to load tunnels")?;

    let output = args.output;
    if let Err(e) = run(args, manager).await {
        print_msg(output, "error", &format!("{e:#}"))?;
        return Err(e);
    }

    info!("tunnelctl command completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn help_renders_with_examples() {
        let mut cmd = Args::command();
        let help = cmd.render_long_help().to_string();
        assert!(
            help.contains("Examples:"),
            "help output should include examples for quick start"
        );
    }

    #[test]
    fn parses_list_default_output() {
        let args = Args::parse_from(["bin", "list"]);
        assert!(matches!(args.command, Command::List));
        assert!(matches!(args.output, OutputFormat::Table));
    }

    #[test]
    fn parses_create_with_json_output() {
        let args = Args::parse_from([
            "bin", "--output", "json", "create", "home", "--file", "home.conf",
        ]);
        assert!(matches!(args.output, OutputFormat::Json));
        match args.command {
            Command::Create { name, file } => {
                assert_eq!(name, "home");
                assert_eq!(file, PathBuf::from("home.conf"));
            }
            _ => panic!("expected create subcommand"),
        }
    }

    #[test]
    fn parses_restore_and_restore_on_boot() {
        let args = Args::parse_from(["bin", "restore", "--force"]);
        assert!(matches!(args.command, Command::Restore { force: true }));

        let args = Args::parse_from(["bin", "restore-on-boot", "on"]);
        assert!(matches!(
            args.command,
            Command::RestoreOnBoot { switch: Some(Switch::On) }
        ));

        let args = Args::parse_from(["bin", "down-all"]);
        assert!(matches!(args.command, Command::DownAll));
    }

    #[test]
    fn rename_takes_two_names() {
        let args = Args::parse_from(["bin", "rename", "home", "work"]);
        match args.command {
            Command::Rename { name, new_name } => {
                assert_eq!(name, "home");
                assert_eq!(new_name, "work");
            }
            _ => panic!("expected rename subcommand"),
        }
        assert!(Args::try_parse_from(["bin", "rename", "home"]).is_err());
    }
}
