//! Core domain types and shared logic for the provisioning gateway.
//!
//! This crate defines the data model used across all other crates:
//! - Machine records reported by the datacenter APIs
//! - Error aggregation (`MultiError`)
//! - Configuration

pub mod config;
pub mod error;
pub mod machine;

pub use error::{BoxError, Error, MultiError, Result};
pub use machine::{ExtraHost, Machine, MachineMetadata};
