//! Chat users known to the gateway.

use crate::error::StoreResult;
use crate::models::ChatUser;
use async_trait::async_trait;
use serde_json::Value;

/// Repository for chat user records.
#[async_trait]
pub trait ChatUserRepo: Send + Sync {
    /// Load a user, creating a not-allowed record on first contact.
    ///
    /// `from` is only stored when the record is created.
    async fn load_chat_user(&self, id: i64, from: &Value) -> StoreResult<ChatUser>;
}
