//! Provisioning gateway.
//!
//! Wires the machine directory and the gateway database together:
//! datacenter discovery at startup, `/etc/hosts` rendering and machine SSH
//! key registration.

pub mod bootstrap;
pub mod error;
pub mod hosts;
pub mod keys;
pub mod register;
pub mod state;

pub use error::{GatewayError, GatewayResult};
pub use keys::{GithubDeployKeys, KeyBackend};
pub use register::{RegisterOutcome, register_key};
pub use state::AppState;
