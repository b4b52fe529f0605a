//! Repository traits for gateway state.

pub mod chat_users;
pub mod hosts;
pub mod keys;
pub mod sequences;

pub use chat_users::ChatUserRepo;
pub use hosts::HostRepo;
pub use keys::KeyRepo;
pub use sequences::{SequenceRepo, seq_next};
