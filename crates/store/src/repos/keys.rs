//! Registered SSH keys.

use crate::error::StoreResult;
use crate::models::KeyRow;
use async_trait::async_trait;

/// Repository for SSH keys registered by machines.
#[async_trait]
pub trait KeyRepo: Send + Sync {
    /// Key stored for a machine id.
    async fn get_key(&self, uuid: &str) -> StoreResult<Option<KeyRow>>;

    /// Store a new key. Fails if the machine already has one.
    async fn add_key(&self, key: &KeyRow) -> StoreResult<()>;
}
