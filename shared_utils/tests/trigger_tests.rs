mod common;

use common::{running, Harness};
use shared_utils::store::PersistedState;
use shared_utils::tunnel::{Trigger, TriggerRouter, TunnelManager, TunnelState};
use std::time::Duration;

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn router(manager: &TunnelManager) -> TriggerRouter {
    TriggerRouter::spawn(manager.clone()).0
}

#[tokio::test]
async fn test_force_all_down_trigger() {
    let h = Harness::loaded(&["a", "b"], &["a", "b"], PersistedState::default()).await;
    let router = router(&h.manager);

    assert!(router.send(Trigger::ForceAllDown));
    eventually(|| h.backend.active().is_empty()).await;
    eventually(|| h.state.running().is_some_and(|r| r.is_empty())).await;
}

#[tokio::test]
async fn test_refresh_trigger_by_action_name() {
    let h = Harness::loaded(&["a"], &[], PersistedState::default()).await;
    let router = router(&h.manager);
    let a = h.tunnel("a");

    h.backend.force("a", true);
    assert!(router.send_action("refresh_tunnel_states"));
    eventually(|| a.state() == TunnelState::Up).await;
    assert!(!router.send_action("set_tunnel_up"));
}

#[tokio::test]
async fn test_restore_trigger_before_load_is_not_dropped() {
    let state = PersistedState {
        restore_on_boot: false,
        running: running(&["a"]),
        ..Default::default()
    };
    let h = Harness::new(&["a", "b"], &[], state);
    let router = router(&h.manager);

    // Restore by trigger is forced, so the flag does not matter.
    assert!(router.send(Trigger::RestoreState));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.backend.active().is_empty());

    h.manager.load().await.unwrap();
    eventually(|| h.backend.is_active("a")).await;
    assert_eq!(h.tunnel("a").state(), TunnelState::Up);
    assert!(!h.backend.is_active("b"));
}

#[tokio::test]
async fn test_forward_stream_and_shutdown() {
    let h = Harness::loaded(&["a"], &["a"], PersistedState::default()).await;
    let (router, task) = TriggerRouter::spawn(h.manager.clone());

    router
        .forward(futures::stream::iter([Trigger::Refresh, Trigger::ForceAllDown]))
        .await;
    eventually(|| !h.backend.is_active("a")).await;

    drop(router);
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("router stops once every sender is gone")
        .unwrap();
}
