//! Directory error types.

use provis_core::MultiError;
use thiserror::Error;

/// One datacenter failed to answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("datacenter {datacenter}: {message}")]
pub struct SourceError {
    pub datacenter: String,
    pub message: String,
}

impl SourceError {
    pub fn new(datacenter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            message: message.into(),
        }
    }
}

/// Directory lookup and refresh errors.
///
/// Cloneable so one refresh outcome can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error("no datacenters configured")]
    NoSources,

    /// Every datacenter that answered contributed nothing and at least one failed.
    #[error("machine list refresh failed: {0}")]
    Refresh(MultiError<SourceError>),

    /// The same machine id was listed twice during a refresh.
    #[error("machine {id} found in more than one datacenter ({first}, {second})")]
    Collision {
        id: String,
        first: String,
        second: String,
    },

    /// A point lookup matched in several datacenters.
    #[error("machine {id} found in multiple datacenters: {}", .datacenters.join(", "))]
    Ambiguous { id: String, datacenters: Vec<String> },

    /// A point lookup found nothing and some datacenters could not be asked.
    #[error("machine lookup failed: {0}")]
    Sources(MultiError<SourceError>),

    #[error("machine {0} not found in any datacenter")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DirectoryError {
    /// Datacenters involved in the failure, for correlation in logs and replies.
    pub fn datacenters(&self) -> Vec<&str> {
        match self {
            Self::Refresh(errors) | Self::Sources(errors) => errors
                .errors()
                .iter()
                .map(|e| e.datacenter.as_str())
                .collect(),
            Self::Collision { first, second, .. } => vec![first.as_str(), second.as_str()],
            Self::Ambiguous { datacenters, .. } => {
                datacenters.iter().map(String::as_str).collect()
            }
            Self::NoSources | Self::NotFound(_) | Self::Internal(_) => Vec::new(),
        }
    }
}

/// Result type for directory operations.
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;
