//! Common test utilities and fixtures.

use async_trait::async_trait;
use provis_core::{Machine, MachineMetadata};
use provis_directory::{MachineSource, SourceError};
use std::net::TcpListener;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory datacenter with call counters and switchable failure.
#[allow(dead_code)]
pub struct MockSource {
    name: String,
    machines: Mutex<Vec<Machine>>,
    failing: AtomicBool,
    delay: Duration,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

#[allow(dead_code)]
impl MockSource {
    pub fn new(name: &str, machines: Vec<Machine>) -> Self {
        Self {
            name: name.to_string(),
            machines: Mutex::new(machines),
            failing: AtomicBool::new(false),
            delay: Duration::ZERO,
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        let source = Self::new(name, Vec::new());
        source.set_failing(true);
        source
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_machines(&self, machines: Vec<Machine>) {
        *self.machines.lock().unwrap() = machines;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<(), SourceError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::new(&self.name, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl MachineSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> Result<Vec<Machine>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        Ok(self.machines.lock().unwrap().clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Machine>, SourceError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        Ok(self
            .machines
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }
}

/// A machine with one address and no metadata.
#[allow(dead_code)]
pub fn machine(id: &str, name: &str, ip: &str) -> Machine {
    Machine {
        id: id.to_string(),
        name: name.to_string(),
        ips: vec![ip.to_string()],
        metadata: MachineMetadata::default(),
    }
}

/// A machine that has published a public key and alias.
#[allow(dead_code)]
pub fn keyed_machine(id: &str, name: &str, ip: &str, pubkey: &str) -> Machine {
    let mut m = machine(id, name, ip);
    m.metadata.pubkey = Some(pubkey.to_string());
    m.metadata.alias = Some(name.to_string());
    m
}

#[allow(dead_code)]
pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}
