//! Directory cache: a TTL-bounded snapshot of every machine, refreshed by
//! fanning out to all datacenters.
//!
//! Concurrent callers that find the cache cold share one refresh. A refresh
//! runs on its own task, so a caller going away does not abandon the other
//! waiters. Snapshots are immutable once published; updates replace the
//! whole `Arc<Snapshot>`.

use crate::error::{DirectoryError, DirectoryResult, SourceError};
use crate::source::MachineSource;
use futures::future::join_all;
use provis_core::config::{ConflictPolicy, DirectoryConfig};
use provis_core::{Machine, MultiError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Every machine known at the time of the last refresh, keyed by id.
#[derive(Debug, Clone)]
pub struct Snapshot {
    machines: BTreeMap<String, Machine>,
    datacenters: BTreeMap<String, String>,
    failed: Vec<SourceError>,
    refreshed_at: SystemTime,
    expires_at: Instant,
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&Machine> {
        self.machines.get(id)
    }

    /// Machines in id order.
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Datacenter that reported a machine.
    pub fn datacenter_of(&self, id: &str) -> Option<&str> {
        self.datacenters.get(id).map(String::as_str)
    }

    /// Datacenters that failed during the refresh that built this snapshot.
    pub fn failed_sources(&self) -> &[SourceError] {
        &self.failed
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn refreshed_at(&self) -> SystemTime {
        self.refreshed_at
    }

    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

type Waiter = oneshot::Sender<DirectoryResult<Arc<Snapshot>>>;

#[derive(Clone, Copy, Debug)]
enum Invalidation {
    Timer,
    Forced,
}

impl Invalidation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Forced => "force",
        }
    }
}

#[derive(Default)]
struct CacheState {
    snapshot: Option<Arc<Snapshot>>,
    loading: bool,
    waiters: Vec<Waiter>,
    /// Bumped whenever the snapshot is installed or cleared, so a stale
    /// expiry timer cannot clear a newer snapshot.
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

impl CacheState {
    fn clear(&mut self, by: Invalidation) {
        if let Some(timer) = self.expiry.take() {
            timer.abort();
        }
        self.generation += 1;
        if let Some(snapshot) = self.snapshot.take() {
            tracing::info!(
                by = by.as_str(),
                entries = snapshot.len(),
                "machine cache invalidated"
            );
        }
    }
}

struct Shared {
    sources: Vec<Arc<dyn MachineSource>>,
    ttl: Duration,
    policy: ConflictPolicy,
    state: Mutex<CacheState>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = state.expiry.take() {
            timer.abort();
        }
    }
}

/// Cloneable handle to the machine directory.
#[derive(Clone)]
pub struct DirectoryCache {
    inner: Arc<Shared>,
}

impl DirectoryCache {
    pub fn new(sources: Vec<Arc<dyn MachineSource>>, config: &DirectoryConfig) -> Self {
        Self::with_policy(sources, config.ttl(), config.conflict_policy)
    }

    pub fn with_policy(
        sources: Vec<Arc<dyn MachineSource>>,
        ttl: Duration,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                sources,
                ttl,
                policy,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Names of the configured datacenters.
    pub fn datacenters(&self) -> Vec<&str> {
        self.inner.sources.iter().map(|s| s.name()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // The state is only touched between awaits and never left half-updated.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The installed snapshot, if present and unexpired. Never triggers a refresh.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.lock().snapshot.clone().filter(|s| s.is_fresh())
    }

    /// The current snapshot, refreshing first if there is none.
    ///
    /// Callers arriving while a refresh is running wait for that refresh
    /// instead of starting another; all of them receive the same outcome.
    /// A failed refresh is not cached.
    pub async fn get_snapshot(&self) -> DirectoryResult<Arc<Snapshot>> {
        let waiter = {
            let mut state = self.lock();
            match state.snapshot.clone() {
                Some(snapshot) if snapshot.is_fresh() => return Ok(snapshot),
                // Expired but the timer has not run yet.
                Some(_) => state.clear(Invalidation::Timer),
                None => {}
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            if !state.loading {
                state.loading = true;
                let cache = self.clone();
                tokio::spawn(async move { cache.refresh().await });
            }
            rx
        };

        waiter
            .await
            .map_err(|_| DirectoryError::Internal("machine refresh was abandoned".to_string()))?
    }

    /// Discard the snapshot. An in-flight refresh is not cancelled and will
    /// install its result when it completes.
    pub fn invalidate(&self) {
        self.lock().clear(Invalidation::Forced);
    }

    /// Look up one machine, asking every datacenter if the snapshot does not
    /// have it.
    ///
    /// A machine found this way is added to the current snapshot. `Ok(None)`
    /// means no datacenter reported it and none failed.
    pub async fn get_one(&self, id: &str) -> DirectoryResult<Option<Machine>> {
        if let Some(machine) = self.current().and_then(|s| s.get(id).cloned()) {
            return Ok(Some(machine));
        }
        self.point_lookup(id).await
    }

    /// Targeted fan-out for one id, bypassing the snapshot.
    pub(crate) async fn point_lookup(&self, id: &str) -> DirectoryResult<Option<Machine>> {
        if self.inner.sources.is_empty() {
            return Err(DirectoryError::NoSources);
        }

        let results = join_all(self.inner.sources.iter().map(|source| async move {
            (source.name().to_string(), source.get(id).await)
        }))
        .await;

        let mut found: Vec<(String, Machine)> = Vec::new();
        let mut errors = Vec::new();
        for (datacenter, result) in results {
            match result {
                Ok(Some(machine)) if machine.id == id => found.push((datacenter, machine)),
                Ok(Some(machine)) => {
                    tracing::warn!(datacenter = %datacenter, machine = id, returned = %machine.id, "lookup answered with a different machine");
                    errors.push(SourceError::new(
                        datacenter,
                        format!("asked for machine {id}, got {}", machine.id),
                    ));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(datacenter = %datacenter, machine = id, error = %e, "machine lookup failed");
                    errors.push(e);
                }
            }
        }

        if found.len() > 1 {
            let datacenters: Vec<String> = found.iter().map(|(dc, _)| dc.clone()).collect();
            match self.inner.policy {
                ConflictPolicy::Reject => {
                    return Err(DirectoryError::Ambiguous {
                        id: id.to_string(),
                        datacenters,
                    });
                }
                ConflictPolicy::PreferFirst => {
                    tracing::warn!(machine = id, datacenters = ?datacenters, "machine found in multiple datacenters, keeping first");
                    found.truncate(1);
                }
            }
        }

        let Some((datacenter, machine)) = found.pop() else {
            return match MultiError::from_list(errors) {
                Some(errors) => Err(DirectoryError::Sources(errors)),
                None => Ok(None),
            };
        };

        self.upsert(&datacenter, &machine);
        Ok(Some(machine))
    }

    /// Replace the current snapshot with a copy holding `machine`.
    fn upsert(&self, datacenter: &str, machine: &Machine) {
        let mut state = self.lock();
        let Some(current) = state.snapshot.as_ref() else {
            return;
        };
        let mut next = Snapshot::clone(current);
        next.machines.insert(machine.id.clone(), machine.clone());
        next.datacenters
            .insert(machine.id.clone(), datacenter.to_string());
        state.snapshot = Some(Arc::new(next));
        tracing::debug!(machine = %machine.id, datacenter, "machine cache repaired");
    }

    async fn refresh(self) {
        let outcome = self.fan_out().await.map(Arc::new);

        let waiters = {
            let mut state = self.lock();
            state.loading = false;
            if let Ok(snapshot) = &outcome {
                self.install(&mut state, snapshot.clone());
            }
            std::mem::take(&mut state.waiters)
        };

        if let Err(e) = &outcome {
            tracing::error!(error = %e, "could not fetch machines");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn install(&self, state: &mut CacheState, snapshot: Arc<Snapshot>) {
        if let Some(timer) = state.expiry.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let expires_at = snapshot.expires_at;
        tracing::info!(
            entries = snapshot.len(),
            failed = snapshot.failed.len(),
            "machine cache updated"
        );
        state.snapshot = Some(snapshot);

        let weak: Weak<Shared> = Arc::downgrade(&self.inner);
        state.expiry = Some(tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.generation == generation {
                    state.expiry = None;
                    state.clear(Invalidation::Timer);
                }
            }
        }));
    }

    /// List every datacenter in parallel and merge the results.
    async fn fan_out(&self) -> DirectoryResult<Snapshot> {
        if self.inner.sources.is_empty() {
            return Err(DirectoryError::NoSources);
        }
        tracing::debug!(datacenters = self.inner.sources.len(), "listing all machines");

        let results = join_all(self.inner.sources.iter().map(|source| async move {
            (source.name().to_string(), source.list().await)
        }))
        .await;

        let mut machines = BTreeMap::new();
        let mut datacenters: BTreeMap<String, String> = BTreeMap::new();
        let mut failed = Vec::new();
        for (datacenter, result) in results {
            let listed = match result {
                Ok(listed) => listed,
                Err(e) => {
                    tracing::warn!(datacenter = %datacenter, error = %e, "list machines failed");
                    failed.push(e);
                    continue;
                }
            };

            for machine in listed {
                if let Some(first) = datacenters.get(&machine.id) {
                    match self.inner.policy {
                        ConflictPolicy::Reject => {
                            return Err(DirectoryError::Collision {
                                id: machine.id,
                                first: first.clone(),
                                second: datacenter,
                            });
                        }
                        ConflictPolicy::PreferFirst => {
                            tracing::warn!(
                                machine = %machine.id,
                                first = %first,
                                second = %datacenter,
                                "machine listed twice, keeping first"
                            );
                            continue;
                        }
                    }
                }
                datacenters.insert(machine.id.clone(), datacenter.clone());
                machines.insert(machine.id.clone(), machine);
            }
        }

        let failed = match MultiError::from_list(failed) {
            Some(errors) if machines.is_empty() => return Err(DirectoryError::Refresh(errors)),
            Some(errors) => errors.into_errors(),
            None => Vec::new(),
        };

        Ok(Snapshot {
            machines,
            datacenters,
            failed,
            refreshed_at: SystemTime::now(),
            expires_at: Instant::now() + self.inner.ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed(Vec<Machine>);

    #[async_trait]
    impl MachineSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn list(&self) -> Result<Vec<Machine>, SourceError> {
            Ok(self.0.clone())
        }

        async fn get(&self, id: &str) -> Result<Option<Machine>, SourceError> {
            Ok(self.0.iter().find(|m| m.id == id).cloned())
        }
    }

    fn machine(id: &str) -> Machine {
        Machine {
            id: id.to_string(),
            name: format!("name-{id}"),
            ips: Vec::new(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_within_one_datacenter_is_a_collision() {
        let cache = DirectoryCache::with_policy(
            vec![Arc::new(Fixed(vec![machine("a"), machine("a")]))],
            Duration::from_secs(60),
            ConflictPolicy::Reject,
        );
        let err = cache.get_snapshot().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Collision { .. }));
        assert!(cache.current().is_none());
    }

    #[tokio::test]
    async fn test_no_sources() {
        let cache =
            DirectoryCache::with_policy(Vec::new(), Duration::from_secs(60), ConflictPolicy::Reject);
        assert!(matches!(
            cache.get_snapshot().await,
            Err(DirectoryError::NoSources)
        ));
        assert!(matches!(
            cache.get_one("x").await,
            Err(DirectoryError::NoSources)
        ));
    }

    #[tokio::test]
    async fn test_all_empty_sources_still_succeed() {
        let cache = DirectoryCache::with_policy(
            vec![Arc::new(Fixed(Vec::new()))],
            Duration::from_secs(60),
            ConflictPolicy::Reject,
        );
        let snapshot = cache.get_snapshot().await.unwrap();
        assert!(snapshot.is_empty());
        assert!(!snapshot.is_partial());
    }
}
