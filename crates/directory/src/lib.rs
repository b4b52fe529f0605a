//! Machine directory for the provisioning gateway.
//!
//! This crate provides:
//! - The `MachineSource` trait and a reqwest-backed datacenter client
//! - `DirectoryCache`, a single-flight, TTL-bounded snapshot of all machines
//! - Lookups by id, IP address and public key, and `/etc/hosts` rendering

pub mod cache;
pub mod error;
pub mod http_source;
pub mod queries;
pub mod source;

pub use cache::{DirectoryCache, Snapshot};
pub use error::{DirectoryError, DirectoryResult, SourceError};
pub use http_source::{HttpMachineSource, sources_for};
pub use queries::{PublicKey, hosts_lines};
pub use source::MachineSource;
