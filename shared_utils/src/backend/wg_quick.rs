//! Backend driving the `wg-quick` and `wg` command-line tools.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::{Backend, BackendError, BackendResult};
use crate::config::BackendConfig;
use crate::tunnel::{Tunnel, TunnelConfig, TunnelState, TunnelStats};

/// Backend that shells out to `wg-quick`/`wg`.
///
/// Each tunnel's configuration is written to `<runtime_dir>/<name>.conf`
/// before `wg-quick up`, which names the interface after the file stem.
#[derive(Debug, Clone)]
pub struct WgQuickBackend {
    wg_quick: String,
    wg: String,
    runtime_dir: PathBuf,
}

impl WgQuickBackend {
    pub fn new(config: &BackendConfig) -> Self {
        WgQuickBackend {
            wg_quick: config.wg_quick.clone(),
            wg: config.wg.clone(),
            runtime_dir: PathBuf::from(&config.runtime_dir),
        }
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{name}.conf"))
    }

    /// Run a system command and return its stdout
    async fn run_command(&self, cmd: &str, args: &[&str]) -> BackendResult<String> {
        debug!("Running command: {} {:?}", cmd, args);

        let output = Command::new(cmd)
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::Command(format!("Failed to execute {cmd}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Command failed: {} {}", output.status, stderr.trim());
            return Err(BackendError::Command(format!(
                "{cmd} {} failed with status {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Write the configuration where `wg-quick` will find it, readable by
    /// the owner only since it carries the private key.
    async fn write_config(&self, name: &str, config: &TunnelConfig) -> BackendResult<PathBuf> {
        fs::create_dir_all(&self.runtime_dir).await?;
        let path = self.config_path(name);
        fs::write(&path, config.as_str()).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(path)
    }

    async fn up(&self, name: &str, config: &TunnelConfig) -> BackendResult<()> {
        let path = self.write_config(name, config).await?;
        self.run_command(&self.wg_quick, &["up", &path_arg(&path)])
            .await?;
        info!(tunnel = %name, "Interface brought up");
        Ok(())
    }

    async fn down(&self, name: &str) -> BackendResult<()> {
        let path = self.config_path(name);
        let target = if fs::try_exists(&path).await.unwrap_or(false) {
            path_arg(&path)
        } else {
            name.to_string()
        };
        self.run_command(&self.wg_quick, &["down", &target]).await?;
        if let Err(e) = fs::remove_file(&path).await {
            debug!(tunnel = %name, error = %e, "No runtime config to remove");
        }
        info!(tunnel = %name, "Interface brought down");
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Parse `wg show interfaces`: whitespace separated interface names.
pub(crate) fn parse_interfaces(output: &str) -> BTreeSet<String> {
    output.split_whitespace().map(str::to_string).collect()
}

/// Parse `wg show <iface> transfer`: one `<key>\t<rx>\t<tx>` line per peer.
pub(crate) fn parse_transfer(output: &str) -> BackendResult<TunnelStats> {
    let mut stats = TunnelStats::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(BackendError::Parse(format!("unexpected transfer line: {line}")));
        }
        let rx = fields[1]
            .parse::<u64>()
            .map_err(|e| BackendError::Parse(format!("bad rx counter {}: {e}", fields[1])))?;
        let tx = fields[2]
            .parse::<u64>()
            .map_err(|e| BackendError::Parse(format!("bad tx counter {}: {e}", fields[2])))?;
        stats.add_peer(fields[0], rx, tx);
    }
    Ok(stats)
}

#[async_trait]
impl Backend for WgQuickBackend {
    async fn enumerate(&self) -> BackendResult<BTreeSet<String>> {
        let output = self.run_command(&self.wg, &["show", "interfaces"]).await?;
        Ok(parse_interfaces(&output))
    }

    async fn get_state(&self, tunnel: &Tunnel) -> BackendResult<TunnelState> {
        let running = self.enumerate().await?;
        Ok(TunnelState::from_active(running.contains(&tunnel.name())))
    }

    async fn get_statistics(&self, tunnel: &Tunnel) -> BackendResult<TunnelStats> {
        let name = tunnel.name();
        let output = self.run_command(&self.wg, &["show", &name, "transfer"]).await?;
        parse_transfer(&output)
    }

    async fn set_state(&self, tunnel: &Tunnel, target: TunnelState) -> BackendResult<TunnelState> {
        let name = tunnel.name();
        let current = self.get_state(tunnel).await?;
        if current == target {
            debug!(tunnel = %name, state = %target, "Interface already in requested state");
            return Ok(target);
        }
        match target {
            TunnelState::Up => {
                let config = tunnel
                    .config()
                    .ok_or_else(|| BackendError::MissingConfig(name.clone()))?;
                self.up(&name, &config).await?;
            }
            TunnelState::Down => self.down(&name).await?,
        }
        Ok(target)
    }

    async fn apply_config(
        &self,
        tunnel: &Tunnel,
        config: TunnelConfig,
    ) -> BackendResult<TunnelConfig> {
        let name = tunnel.name();
        if self.get_state(tunnel).await?.is_up() {
            // A running interface only picks up a new config on restart.
            self.down(&name).await?;
            self.up(&name, &config).await?;
        }
        Ok(config)
    }
}
