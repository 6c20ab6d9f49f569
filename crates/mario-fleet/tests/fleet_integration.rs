//! Fleet and dashboard integration tests.
//!
//! These run without a live SSH endpoint: tunnels are registered with
//! `no_connect`, or pointed at an address that refuses connections so the
//! error paths and the status pipeline can be observed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use mario_fleet::{Act, Dashboard, Fleet, FleetError, Target};
use mario_ssh::TunnelStatus;

static KEY_SEQ: AtomicU32 = AtomicU32::new(0);

/// Write a freshly generated ed25519 key to a temp file and return its
/// path.
fn write_test_key() -> PathBuf {
    let key = russh_keys::key::KeyPair::generate_ed25519().expect("generate ed25519 key");
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).expect("encode key");
    let path = std::env::temp_dir().join(format!(
        "mario-fleet-test-{}-{}.pem",
        std::process::id(),
        KEY_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::write(&path, pem).expect("write key file");
    path
}

fn test_fleet() -> std::sync::Arc<Fleet> {
    Fleet::new(Some(write_test_key()), Duration::from_secs(30))
}

#[tokio::test]
async fn establish_mints_increasing_ids_and_default_names() {
    let fleet = test_fleet();
    let a = fleet
        .establish("", ":18081", "core@gateway:22", "db:5432", None, true)
        .await
        .unwrap();
    let b = fleet
        .establish("etcd", ":18082", "core@gateway:22", "db:5433", None, true)
        .await
        .unwrap();
    let c = fleet
        .establish("", ":18083", "core@gateway", "db:5434", None, true)
        .await
        .unwrap();

    assert!(a.id() < b.id() && b.id() < c.id());
    assert_eq!(a.name(), a.id().to_string());
    assert_eq!(b.name(), "etcd");
    assert_eq!(b.local(), "0.0.0.0:18082");
    assert_eq!(b.server(), "core@gateway:22");
    assert_eq!(c.server(), "core@gateway:22");
    assert_eq!(b.remote(), "db:5433");
    assert_eq!(b.status_str(), "new");
    assert!(b.error().is_none());
}

#[tokio::test]
async fn establish_reads_the_per_tunnel_key() {
    let fleet = test_fleet();
    let key = write_test_key();
    let view = fleet
        .establish("k", ":18084", "core@gateway:22", "db:1", Some(&key), true)
        .await
        .unwrap();
    assert_eq!(view.private_key_path(), Some(key.as_path()));
}

#[tokio::test]
async fn establish_rejects_bad_descriptors_without_creating_state() {
    let fleet = test_fleet();
    let err = fleet
        .establish("", "nolocal", "core@gateway:22", "db:5432", None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Tunnel(_)));

    let err = fleet
        .establish("", ":18085", "gateway:22", "db:5432", None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Tunnel(_)));
}

#[tokio::test]
async fn establish_fails_on_unreadable_key_file() {
    let fleet = test_fleet();
    let missing = PathBuf::from("/nonexistent/mario/key");
    let err = fleet
        .establish("", ":18086", "core@gateway:22", "db:1", Some(&missing), true)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Key { .. }));
}

#[tokio::test]
async fn monitor_is_single_use() {
    let fleet = test_fleet();
    let _events = fleet.monitor().await.unwrap();
    assert!(matches!(
        fleet.monitor().await,
        Err(FleetError::AlreadyMonitoring)
    ));
}

#[tokio::test]
async fn monitor_fails_when_the_global_key_is_missing() {
    let fleet = Fleet::new(
        Some(PathBuf::from("/nonexistent/mario/id_rsa")),
        Duration::from_secs(30),
    );
    assert!(matches!(fleet.monitor().await, Err(FleetError::Key { .. })));
}

#[tokio::test]
async fn status_events_flow_through_the_dispatcher_in_order() {
    let fleet = test_fleet();
    let mut events = fleet.monitor().await.unwrap();

    // nothing listens on port 1, so the dial fails and keeps retrying on
    // the (long) health interval; we only care about the first transitions
    let view = fleet
        .establish("broken", ":18087", "core@127.0.0.1:1", "db:5432", None, false)
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for status event")
        .expect("status stream closed");
    assert_eq!(first.id(), view.id());
    assert_eq!(first.name(), "broken");

    let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for status event")
        .expect("status stream closed");
    assert_eq!(second.id(), view.id());
    assert!(second.status().contains(TunnelStatus::ERROR));
    assert_eq!(second.status_str(), "error");

    fleet.stop().await;
}

#[tokio::test]
async fn up_on_a_new_tunnel_starts_it_in_the_background() {
    let fleet = test_fleet();
    let mut events = fleet.monitor().await.unwrap();

    let view = fleet
        .establish("lazy", ":18088", "core@127.0.0.1:1", "db:5432", None, true)
        .await
        .unwrap();
    assert_eq!(view.status_str(), "new");

    let (done, mut signaled) = tokio::sync::mpsc::channel(1);
    fleet.up(&view, Some(done)).await;
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), signaled.recv())
            .await
            .expect("timed out waiting for completion"),
        Some(())
    );

    // the background connect attempt publishes transitions for this tunnel
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for status event")
        .expect("status stream closed");
    assert_eq!(event.id(), view.id());

    fleet.stop().await;
}

#[tokio::test]
async fn apply_all_close_completes_within_the_bounded_wait() {
    let fleet = test_fleet();
    for i in 0..3 {
        fleet
            .establish(
                &format!("t{i}"),
                &format!(":1809{i}"),
                "core@gateway:22",
                "db:5432",
                None,
                true,
            )
            .await
            .unwrap();
    }
    let started = std::time::Instant::now();
    // non-running tunnels complete their close immediately
    fleet.apply_all(Act::Close, true).await;
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn stop_returns_within_the_bounded_wait() {
    let fleet = test_fleet();
    let _events = fleet.monitor().await.unwrap();
    for i in 0..2 {
        fleet
            .establish(
                &format!("s{i}"),
                &format!(":1819{i}"),
                "core@gateway:22",
                "db:5432",
                None,
                true,
            )
            .await
            .unwrap();
    }
    let started = std::time::Instant::now();
    fleet.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn dashboard_indexes_views_by_id() {
    let fleet = test_fleet();
    let dashboard = Dashboard::new(fleet);
    dashboard.start().await.unwrap();

    let a = dashboard
        .new_tunnel("alpha", ":18201", "core@gateway:22", "db:1", None, true)
        .await
        .unwrap();
    let b = dashboard
        .new_tunnel("beta", ":18202", "core@gateway:22", "db:2", None, true)
        .await
        .unwrap();

    // the receive loop applies updates asynchronously
    let mut indexed = false;
    for _ in 0..200 {
        if dashboard.tunnels().len() == 2 {
            indexed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(indexed, "dashboard never indexed the new tunnels");

    let snapshot = dashboard.tunnels();
    assert!(snapshot[0].id() < snapshot[1].id());

    let found = dashboard.get_tunnel(&Target::Id(a.id())).unwrap();
    assert_eq!(found.name(), "alpha");
    let found = dashboard.get_tunnel(&Target::Name("beta".to_string())).unwrap();
    assert_eq!(found.id(), b.id());
    assert!(dashboard.get_tunnel(&Target::Id(9999)).is_none());
    assert!(dashboard
        .get_tunnel(&Target::Name("gamma".to_string()))
        .is_none());

    let err = dashboard.close(&Target::Id(9999), false).await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));

    // close-all on non-running tunnels is a fast no-op
    dashboard.close(&Target::All, true).await.unwrap();
    dashboard.quit().await;
}

#[tokio::test]
async fn dashboard_start_is_single_use() {
    let fleet = test_fleet();
    let dashboard = Dashboard::new(fleet);
    dashboard.start().await.unwrap();
    assert!(matches!(
        dashboard.start().await,
        Err(FleetError::AlreadyMonitoring)
    ));
}
