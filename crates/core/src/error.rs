//! Error types shared across crates.

use std::fmt;
use thiserror::Error;

/// Boxed error used for caller-supplied failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid table declaration: {0}")]
    InvalidTable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An ordered, non-empty list of errors that together failed one operation.
///
/// Any single cause is sufficient to fail the operation that produced the
/// list; callers never receive an empty `MultiError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiError<E = BoxError> {
    errors: Vec<E>,
}

impl<E> MultiError<E> {
    /// Fold a list of errors into a `MultiError`, or `None` if the list is empty.
    pub fn from_list(errors: Vec<E>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    pub fn single(error: E) -> Self {
        Self {
            errors: vec![error],
        }
    }

    /// Record a further cause after the existing ones.
    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }

    /// The first recorded cause.
    pub fn first(&self) -> &E {
        &self.errors[0]
    }

    /// All causes, in the order they were recorded.
    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            1 => write!(f, "{}", self.errors[0]),
            n => write!(f, "first of {} errors: {}", n, self.errors[0]),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for MultiError<E> {}
