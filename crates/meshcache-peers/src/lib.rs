//! Peer identity and registry.
//!
//! [`PeerIdentity`] gives each node a stable cryptographic identifier that
//! survives restarts. [`PeerRegistry`] owns [`PeerRecord`] lifecycle:
//! bootstrap, gossip merges, liveness tracking, and the registry state
//! machine (including the terminal `Disabled` state entered when the
//! transport cannot bind).

pub mod identity;
pub mod registry;

pub use identity::PeerIdentity;
pub use registry::{PeerAdvert, PeerRecord, PeerRegistry, RegistryState};
