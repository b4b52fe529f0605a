//! Machine SSH key registration.

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;
use provis_store::models::KeyRow;
use provis_store::repos::KeyRepo;
use serde::Serialize;

/// Where a registered key ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterOutcome {
    pub machine_id: String,
    pub key_in_backend: bool,
    pub key_in_database: bool,
}

/// Register `ssh_key` for the machine that owns `ip`.
///
/// The machine's name, its published alias and `alias` must agree. A key
/// that is already stored must match; re-registering the same key is a
/// no-op. A new key is pushed to the key backend (when configured) before
/// it is stored, so a stored key is always one the backend accepted.
pub async fn register_key(
    state: &AppState,
    ip: &str,
    alias: &str,
    ssh_key: &str,
) -> GatewayResult<RegisterOutcome> {
    let ssh_key = ssh_key.trim();
    if ssh_key.is_empty() {
        return Err(GatewayError::BadRequest("empty key".to_string()));
    }

    let Some(machine) = state.directory.machine_by_ip(ip).await? else {
        tracing::warn!(ip, alias, "key registration from unknown machine");
        return Err(GatewayError::BadRequest("unknown machine".to_string()));
    };

    if machine.name != alias || machine.metadata.alias.as_deref() != Some(alias) {
        tracing::warn!(
            machine = %machine.id,
            name = %machine.name,
            metadata_alias = ?machine.metadata.alias,
            alias,
            "key registration with mismatched alias"
        );
        return Err(GatewayError::BadRequest("mismatched alias".to_string()));
    }

    let mut outcome = RegisterOutcome {
        machine_id: machine.id.clone(),
        key_in_backend: false,
        key_in_database: false,
    };

    match state.store.get_key(&machine.id).await? {
        Some(existing) if existing.matches(ssh_key) => {
            tracing::info!(machine = %machine.id, "key already registered");
            outcome.key_in_backend = true;
            outcome.key_in_database = true;
            return Ok(outcome);
        }
        Some(_) => {
            tracing::warn!(machine = %machine.id, "existing key does not match");
            return Err(GatewayError::BadRequest(
                "existing key does not match".to_string(),
            ));
        }
        // A machine registering for the first time is new enough that other
        // cached views of the fleet are stale too.
        None => state.directory.invalidate(),
    }

    if let Some(backend) = &state.keys {
        backend.add_key(&machine.id, ssh_key).await?;
        outcome.key_in_backend = true;
    }

    state
        .store
        .add_key(&KeyRow {
            uuid: machine.id.clone(),
            alias: alias.to_string(),
            ssh_key: ssh_key.to_string(),
        })
        .await?;
    outcome.key_in_database = true;

    tracing::info!(
        machine = %machine.id,
        alias,
        key_in_backend = outcome.key_in_backend,
        "key registered"
    );
    Ok(outcome)
}
