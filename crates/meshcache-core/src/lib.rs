//! Core types shared across the meshcache workspace.
//!
//! This crate holds the pieces every other layer depends on: the unified
//! error type, peer identifiers, the centralized hash module (including the
//! validation hasher used for staleness detection), wall-clock helpers, and
//! the construction-time configuration struct.

pub mod config;
pub mod errors;
pub mod hash;
pub mod identifiers;
pub mod time;

pub use config::CacheConfig;
pub use errors::{CacheError, CacheResult};
pub use identifiers::PeerId;
