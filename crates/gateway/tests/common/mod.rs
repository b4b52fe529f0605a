//! Common test utilities and fixtures.

use async_trait::async_trait;
use provis_core::config::{AppConfig, StorageConfig};
use provis_core::{Machine, MachineMetadata};
use provis_directory::{DirectoryCache, MachineSource, SourceError};
use provis_gateway::{AppState, GatewayError, GatewayResult, KeyBackend};
use provis_store::SqliteStore;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;

/// Fixed set of machines in one datacenter.
#[allow(dead_code)]
pub struct StaticSource {
    machines: Vec<Machine>,
    list_calls: AtomicUsize,
}

#[allow(dead_code)]
impl StaticSource {
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            machines,
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MachineSource for StaticSource {
    fn name(&self) -> &str {
        "test-1"
    }

    async fn list(&self) -> Result<Vec<Machine>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.machines.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Machine>, SourceError> {
        Ok(self.machines.iter().find(|m| m.id == id).cloned())
    }
}

/// Key backend that records what it was asked to add.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingKeys {
    added: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl RecordingKeys {
    pub fn failing() -> Self {
        let keys = Self::default();
        keys.failing.store(true, Ordering::SeqCst);
        keys
    }

    pub fn added(&self) -> Vec<(String, String)> {
        self.added.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyBackend for RecordingKeys {
    async fn add_key(&self, title: &str, key: &str) -> GatewayResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::KeyBackend(
                "API error (422 Unprocessable Entity): key is already in use".to_string(),
            ));
        }
        self.added
            .lock()
            .unwrap()
            .push((title.to_string(), key.to_string()));
        Ok(())
    }
}

/// Gateway state over a temporary database and an in-memory datacenter.
#[allow(dead_code)]
pub struct TestGateway {
    _dir: TempDir,
    pub state: AppState,
    pub source: Arc<StaticSource>,
}

#[allow(dead_code)]
impl TestGateway {
    pub async fn new(machines: Vec<Machine>, keys: Option<Arc<dyn KeyBackend>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_testing();
        config.storage = test_storage(&dir);

        let store = SqliteStore::open(&config.storage).await.unwrap();
        let source = Arc::new(StaticSource::new(machines));
        let directory = DirectoryCache::new(
            vec![source.clone() as Arc<dyn MachineSource>],
            &config.directory,
        );
        let state = AppState::new(config, Arc::new(store), directory, keys);
        Self {
            _dir: dir,
            state,
            source,
        }
    }
}

#[allow(dead_code)]
pub fn test_storage(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        path: dir.path().join("var").join("provis.sqlite3"),
        ..Default::default()
    }
}

/// A machine whose name and published alias agree.
#[allow(dead_code)]
pub fn machine(id: &str, name: &str, ip: &str) -> Machine {
    Machine {
        id: id.to_string(),
        name: name.to_string(),
        ips: vec![ip.to_string()],
        metadata: MachineMetadata {
            alias: Some(name.to_string()),
            ..Default::default()
        },
    }
}

#[allow(dead_code)]
pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}
