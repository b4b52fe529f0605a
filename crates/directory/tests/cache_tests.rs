//! Integration tests for the directory cache.

mod common;

use common::{MockSource, keyed_machine, machine};
use futures::future::join_all;
use provis_core::config::ConflictPolicy;
use provis_directory::{DirectoryCache, DirectoryError, MachineSource};
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(600);

fn cache_over(sources: &[Arc<MockSource>], policy: ConflictPolicy) -> DirectoryCache {
    let sources: Vec<Arc<dyn MachineSource>> = sources
        .iter()
        .map(|s| s.clone() as Arc<dyn MachineSource>)
        .collect();
    DirectoryCache::with_policy(sources, TTL, policy)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_refresh() {
    let a = Arc::new(
        MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")])
            .with_delay(Duration::from_millis(100)),
    );
    let b = Arc::new(
        MockSource::new("dc-b", vec![machine("m2", "web1", "10.0.0.2")])
            .with_delay(Duration::from_millis(30)),
    );
    let cache = cache_over(&[a.clone(), b.clone()], ConflictPolicy::Reject);

    let snapshots = join_all((0..10).map(|_| cache.get_snapshot())).await;
    let snapshots: Vec<_> = snapshots.into_iter().map(|s| s.unwrap()).collect();

    assert_eq!(a.list_calls(), 1);
    assert_eq!(b.list_calls(), 1);
    assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
    assert_eq!(snapshots[0].len(), 2);

    // Warm cache: no further fan-out.
    cache.get_snapshot().await.unwrap();
    assert_eq!(a.list_calls(), 1);
}

#[tokio::test]
async fn test_one_failed_datacenter_is_tolerated() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let b = Arc::new(MockSource::failing("dc-b"));
    let c = Arc::new(MockSource::new(
        "dc-c",
        vec![
            machine("m2", "web1", "10.0.0.2"),
            machine("m3", "web2", "10.0.0.3"),
        ],
    ));
    let cache = cache_over(&[a, b, c], ConflictPolicy::Reject);

    let snapshot = cache.get_snapshot().await.unwrap();
    let ids: Vec<&str> = snapshot.machines().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert!(snapshot.is_partial());
    assert_eq!(snapshot.failed_sources()[0].datacenter, "dc-b");
    assert_eq!(snapshot.datacenter_of("m2"), Some("dc-c"));
}

#[tokio::test]
async fn test_all_datacenters_failing_is_not_cached() {
    let a = Arc::new(MockSource::failing("dc-a"));
    let b = Arc::new(MockSource::failing("dc-b"));
    let cache = cache_over(&[a.clone(), b.clone()], ConflictPolicy::Reject);

    let err = cache.get_snapshot().await.unwrap_err();
    match &err {
        DirectoryError::Refresh(errors) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.datacenters(), vec!["dc-a", "dc-b"]);

    a.set_failing(false);
    a.set_machines(vec![machine("m1", "web0", "10.0.0.1")]);
    let snapshot = cache.get_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(a.list_calls(), 2);
}

#[tokio::test]
async fn test_failed_datacenter_with_empty_rest_fails() {
    let a = Arc::new(MockSource::new("dc-a", Vec::new()));
    let b = Arc::new(MockSource::failing("dc-b"));
    let cache = cache_over(&[a, b], ConflictPolicy::Reject);

    assert!(matches!(
        cache.get_snapshot().await,
        Err(DirectoryError::Refresh(_))
    ));
}

#[tokio::test]
async fn test_id_collision_fails_refresh() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let b = Arc::new(MockSource::new(
        "dc-b",
        vec![
            machine("m2", "web1", "10.0.0.2"),
            machine("m1", "web0-copy", "10.9.0.1"),
        ],
    ));
    let cache = cache_over(&[a, b.clone()], ConflictPolicy::Reject);

    let err = cache.get_snapshot().await.unwrap_err();
    match err {
        DirectoryError::Collision { id, first, second } => {
            assert_eq!(id, "m1");
            assert_eq!(first, "dc-a");
            assert_eq!(second, "dc-b");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(cache.current().is_none());

    // The next call retries from scratch.
    b.set_machines(vec![machine("m2", "web1", "10.0.0.2")]);
    assert_eq!(cache.get_snapshot().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_prefer_first_policy_keeps_first_datacenter() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let b = Arc::new(MockSource::new("dc-b", vec![machine("m1", "stale", "10.9.0.1")]));
    let cache = cache_over(&[a, b], ConflictPolicy::PreferFirst);

    let snapshot = cache.get_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get("m1").unwrap().name, "web0");
    assert_eq!(snapshot.datacenter_of("m1"), Some("dc-a"));
    assert_eq!(cache.get_one("m1").await.unwrap().unwrap().name, "web0");
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_expires_after_ttl() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let cache = cache_over(&[a.clone()], ConflictPolicy::Reject);

    cache.get_snapshot().await.unwrap();
    tokio::time::advance(TTL - Duration::from_secs(1)).await;
    cache.get_snapshot().await.unwrap();
    assert_eq!(a.list_calls(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.current().is_none());
    cache.get_snapshot().await.unwrap();
    assert_eq!(a.list_calls(), 2);
}

#[tokio::test]
async fn test_invalidate_forces_refresh() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let cache = cache_over(&[a.clone()], ConflictPolicy::Reject);

    cache.get_snapshot().await.unwrap();
    cache.invalidate();
    assert!(cache.current().is_none());
    // Invalidating an empty cache is harmless.
    cache.invalidate();

    cache.get_snapshot().await.unwrap();
    assert_eq!(a.list_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_during_refresh_keeps_result() {
    let a = Arc::new(
        MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")])
            .with_delay(Duration::from_millis(50)),
    );
    let cache = cache_over(&[a.clone()], ConflictPolicy::Reject);

    let pending = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_snapshot().await }
    });
    tokio::task::yield_now().await;
    cache.invalidate();

    pending.await.unwrap().unwrap();
    assert_eq!(cache.current().unwrap().len(), 1);
    assert_eq!(a.list_calls(), 1);
}

#[tokio::test]
async fn test_get_one_repairs_snapshot() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let b = Arc::new(MockSource::new("dc-b", Vec::new()));
    let cache = cache_over(&[a.clone(), b.clone()], ConflictPolicy::Reject);

    cache.get_snapshot().await.unwrap();
    b.set_machines(vec![machine("m2", "new0", "10.0.0.9")]);

    let found = cache.get_one("m2").await.unwrap().unwrap();
    assert_eq!(found.name, "new0");

    let snapshot = cache.current().unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.get("m1").is_some());
    assert_eq!(snapshot.datacenter_of("m2"), Some("dc-b"));
    assert_eq!(a.list_calls(), 1);

    // Served from the repaired snapshot.
    cache.get_one("m2").await.unwrap();
    assert_eq!(b.get_calls(), 1);
}

#[tokio::test]
async fn test_get_one_without_snapshot_does_not_install_one() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let cache = cache_over(&[a.clone()], ConflictPolicy::Reject);

    assert!(cache.get_one("m1").await.unwrap().is_some());
    assert!(cache.current().is_none());
    assert_eq!(a.list_calls(), 0);
}

#[tokio::test]
async fn test_get_one_in_two_datacenters_is_ambiguous() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let b = Arc::new(MockSource::new("dc-b", vec![machine("m1", "web0", "10.0.0.1")]));
    let cache = cache_over(&[a, b], ConflictPolicy::Reject);

    match cache.get_one("m1").await {
        Err(DirectoryError::Ambiguous { id, datacenters }) => {
            assert_eq!(id, "m1");
            assert_eq!(datacenters, vec!["dc-a", "dc-b"]);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_get_one_not_found_versus_source_errors() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let b = Arc::new(MockSource::new("dc-b", Vec::new()));
    let cache = cache_over(&[a.clone(), b.clone()], ConflictPolicy::Reject);

    assert!(cache.get_one("missing").await.unwrap().is_none());

    b.set_failing(true);
    // Found in a healthy datacenter: the failure is absorbed.
    assert!(cache.get_one("m1").await.unwrap().is_some());
    // Not found anywhere that answered: the failure surfaces.
    match cache.get_one("missing").await {
        Err(DirectoryError::Sources(errors)) => {
            assert_eq!(errors.first().datacenter, "dc-b");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_pubkey_lookup_falls_back_to_datacenters() {
    let a = Arc::new(MockSource::new("dc-a", vec![machine("m1", "web0", "10.0.0.1")]));
    let cache = cache_over(&[a.clone()], ConflictPolicy::Reject);

    // Listed without a key yet.
    assert_eq!(cache.pubkey_for("m1").await.unwrap(), None);

    a.set_machines(vec![keyed_machine("m1", "web0", "10.0.0.1", "ssh-ed25519 AAAA")]);
    assert_eq!(
        cache.pubkey_for("m1").await.unwrap().as_deref(),
        Some("ssh-ed25519 AAAA")
    );
    // The repaired snapshot answers directly now.
    let gets = a.get_calls();
    cache.pubkey_for("m1").await.unwrap();
    assert_eq!(a.get_calls(), gets);

    assert!(matches!(
        cache.pubkey_for("nope").await,
        Err(DirectoryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_public_keys_and_ip_lookup() {
    let a = Arc::new(MockSource::new(
        "dc-a",
        vec![
            keyed_machine("m2", "db0", "10.0.0.2", "ssh-rsa BBBB"),
            machine("m1", "web0", "10.0.0.1"),
        ],
    ));
    let cache = cache_over(&[a], ConflictPolicy::Reject);

    let keys = cache.public_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].name, "db0");

    let found = cache.machine_by_ip("10.0.0.1").await.unwrap().unwrap();
    assert_eq!(found.id, "m1");
    assert!(cache.machine_by_ip("10.0.0.99").await.unwrap().is_none());
}
