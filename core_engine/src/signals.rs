//! Maps Unix signals onto tunnel triggers.
use shared_utils::tunnel::Trigger;
use std::pin::Pin;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_stream::Stream;
use tracing::{error, info};

/// Signals understood by the daemon and the trigger each one raises.
pub const TRIGGER_SIGNALS: [(&str, Trigger); 3] = [
    ("SIGHUP", Trigger::Refresh),
    ("SIGUSR1", Trigger::RestoreState),
    ("SIGUSR2", Trigger::ForceAllDown),
];

fn kind(name: &str) -> Option<SignalKind> {
    match name {
        "SIGHUP" => Some(SignalKind::hangup()),
        "SIGUSR1" => Some(SignalKind::user_defined1()),
        "SIGUSR2" => Some(SignalKind::user_defined2()),
        _ => None,
    }
}

fn register(name: &str) -> Option<Signal> {
    let kind = kind(name)?;
    match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to register signal handler for {}: {}", name, e);
            None
        }
    }
}

/// Stream of triggers raised by incoming signals. Ends immediately if a
/// handler cannot be installed.
pub fn trigger_signals() -> Pin<Box<dyn Stream<Item = Trigger> + Send>> {
    let stream = async_stream::stream! {
        let Some(mut hangup) = register("SIGHUP") else { return };
        let Some(mut usr1) = register("SIGUSR1") else { return };
        let Some(mut usr2) = register("SIGUSR2") else { return };

        info!("Listening for trigger signals (SIGHUP, SIGUSR1, SIGUSR2).");

        loop {
            let name = tokio::select! {
                Some(()) = hangup.recv() => "SIGHUP",
                Some(()) = usr1.recv() => "SIGUSR1",
                Some(()) = usr2.recv() => "SIGUSR2",
                else => break,
            };
            if let Some((_, trigger)) = TRIGGER_SIGNALS.iter().find(|(n, _)| *n == name) {
                info!(signal = name, %trigger, "Received trigger signal");
                yield *trigger;
            }
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_trigger_has_a_signal() {
        for trigger in Trigger::ALL {
            assert!(TRIGGER_SIGNALS.iter().any(|(_, t)| *t == trigger));
        }
        for (name, _) in TRIGGER_SIGNALS {
            assert!(kind(name).is_some(), "{name} should map to a signal kind");
        }
    }
}
