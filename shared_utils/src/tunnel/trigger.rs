//! External triggers routed to the tunnel manager.
//!
//! A trigger names a bulk action (refresh, force everything down, restore
//! the saved running set). Senders never wait on the outcome; each trigger
//! is dispatched on its own task and its result is logged.

use futures::{Stream, StreamExt};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::tunnel::manager::TunnelManager;

/// Bulk action requested from outside the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Re-poll the backend for every tunnel's state
    Refresh,
    /// Bring every running tunnel down
    ForceAllDown,
    /// Bring the saved running set back up, regardless of restore-on-boot
    RestoreState,
}

impl Trigger {
    pub const ALL: [Trigger; 3] = [Trigger::Refresh, Trigger::ForceAllDown, Trigger::RestoreState];

    /// Action name accepted over external channels.
    pub fn action(self) -> &'static str {
        match self {
            Trigger::Refresh => "refresh_tunnel_states",
            Trigger::ForceAllDown => "set_all_tunnel_down",
            Trigger::RestoreState => "restore_state",
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            Trigger::Refresh => "refresh",
            Trigger::ForceAllDown => "force-all-down",
            Trigger::RestoreState => "restore-state",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Trigger::ALL
            .into_iter()
            .find(|t| t.action().eq_ignore_ascii_case(s) || t.short_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown trigger action: {s}"))
    }
}

/// Handle for delivering triggers to a manager.
#[derive(Debug, Clone)]
pub struct TriggerRouter {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl TriggerRouter {
    /// Start routing triggers to `manager`. The returned task ends once every
    /// router clone has been dropped.
    pub fn spawn(manager: TunnelManager) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Trigger>();
        let task = tokio::spawn(async move {
            while let Some(trigger) = rx.recv().await {
                debug!(%trigger, "Trigger received");
                tokio::spawn(dispatch(manager.clone(), trigger));
            }
            debug!("Trigger router stopped");
        });
        (TriggerRouter { tx }, task)
    }

    /// Queue a trigger. Returns `false` if the router has stopped.
    pub fn send(&self, trigger: Trigger) -> bool {
        if self.tx.send(trigger).is_err() {
            warn!(%trigger, "Trigger router is gone; dropping trigger");
            return false;
        }
        true
    }

    /// Parse and queue an action by name; unknown actions are ignored.
    pub fn send_action(&self, action: &str) -> bool {
        match action.parse::<Trigger>() {
            Ok(trigger) => self.send(trigger),
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    /// Forward every trigger from `stream` until it ends.
    pub async fn forward<S>(&self, stream: S)
    where
        S: Stream<Item = Trigger>,
    {
        futures::pin_mut!(stream);
        while let Some(trigger) = stream.next().await {
            if !self.send(trigger) {
                break;
            }
        }
    }
}

async fn dispatch(manager: TunnelManager, trigger: Trigger) {
    let result = match trigger {
        Trigger::Refresh => manager.refresh_tunnel_states().await,
        Trigger::ForceAllDown => manager.set_all_down().await,
        Trigger::RestoreState => manager.restore_state(true).await,
    };
    match result {
        Ok(()) => info!(%trigger, "Trigger handled"),
        Err(e) => error!(%trigger, error = %e, "Trigger failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action_names() {
        assert_eq!("refresh_tunnel_states".parse::<Trigger>(), Ok(Trigger::Refresh));
        assert_eq!("SET_ALL_TUNNEL_DOWN".parse::<Trigger>(), Ok(Trigger::ForceAllDown));
        assert_eq!(" restore-state ".parse::<Trigger>(), Ok(Trigger::RestoreState));
        assert!("reboot".parse::<Trigger>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for trigger in Trigger::ALL {
            assert_eq!(trigger.to_string().parse::<Trigger>(), Ok(trigger));
            assert_eq!(trigger.action().parse::<Trigger>(), Ok(trigger));
        }
    }
}
