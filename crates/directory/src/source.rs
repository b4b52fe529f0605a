//! Remote machine sources, one per datacenter.

use crate::error::SourceError;
use async_trait::async_trait;
use provis_core::Machine;

/// A datacenter API that can list machines and look one up by id.
#[async_trait]
pub trait MachineSource: Send + Sync {
    /// Datacenter name, used in logs and errors.
    fn name(&self) -> &str;

    /// Every machine in this datacenter.
    async fn list(&self) -> Result<Vec<Machine>, SourceError>;

    /// One machine by id. `Ok(None)` means this datacenter does not have it.
    async fn get(&self, id: &str) -> Result<Option<Machine>, SourceError>;
}
