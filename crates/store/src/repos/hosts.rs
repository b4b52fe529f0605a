//! Extra host entries and host identity keys.

use crate::error::StoreResult;
use crate::models::EtcHostRow;
use async_trait::async_trait;

/// Repository for host records that live outside the datacenters.
#[async_trait]
pub trait HostRepo: Send + Sync {
    /// All extra `/etc/hosts` entries.
    async fn etchosts(&self) -> StoreResult<Vec<EtcHostRow>>;

    /// Insert or replace the entry for an address.
    async fn upsert_etchost(&self, row: &EtcHostRow) -> StoreResult<()>;

    /// Public key registered for a host id, if any.
    async fn hostid_pubkey(&self, hostid: &str) -> StoreResult<Option<String>>;

    /// Record the public key for a host id, replacing any earlier one.
    async fn register_hostid(&self, hostid: &str, hostname: &str, pubkey: &str)
    -> StoreResult<()>;
}
