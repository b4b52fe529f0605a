//! Database models mapping to the gateway schema.

use crate::error::StoreResult;
use serde_json::Value;
use sqlx::FromRow;

// =============================================================================
// Extra /etc/hosts entries
// =============================================================================

/// Host entry that is not a datacenter machine.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct EtcHostRow {
    pub ipaddr: String,
    pub hostname: String,
    pub environ: String,
}

impl From<EtcHostRow> for provis_core::ExtraHost {
    fn from(row: EtcHostRow) -> Self {
        Self {
            ipaddr: row.ipaddr,
            hostname: row.hostname,
        }
    }
}

// =============================================================================
// Host identities
// =============================================================================

/// Public key registered for a host id.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct HostIdRow {
    pub hostid: String,
    pub hostname: String,
    pub pubkey: String,
}

// =============================================================================
// Deploy keys
// =============================================================================

/// SSH key registered for a machine. `uuid` is the machine id.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct KeyRow {
    pub uuid: String,
    pub alias: String,
    pub ssh_key: String,
}

impl KeyRow {
    /// Whether `ssh_key` is the stored key, ignoring surrounding whitespace.
    pub fn matches(&self, ssh_key: &str) -> bool {
        self.ssh_key.trim() == ssh_key.trim()
    }
}

// =============================================================================
// Chat users
// =============================================================================

/// Raw chat user record; `json` is the serialized sender profile.
#[derive(Debug, Clone, FromRow)]
pub struct ChatUserRow {
    pub id: i64,
    pub json: String,
    pub allow: bool,
    pub notified: bool,
}

/// Chat user with its sender profile decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatUser {
    pub id: i64,
    pub from: Value,
    pub allow: bool,
    pub notified: bool,
}

impl ChatUser {
    /// A user seen for the first time: not allowed, not yet notified.
    pub fn new(id: i64, from: Value) -> Self {
        Self {
            id,
            from,
            allow: false,
            notified: false,
        }
    }
}

impl TryFrom<ChatUserRow> for ChatUser {
    type Error = crate::error::StoreError;

    fn try_from(row: ChatUserRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            from: serde_json::from_str(&row.json)?,
            allow: row.allow,
            notified: row.notified,
        })
    }
}
