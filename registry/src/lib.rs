//! Sessions, peers and the signal audit log.

pub mod memory;
pub mod model;
pub mod store;

pub use memory::MemoryStore;
pub use model::{
    MediaFlags, MediaUpdate, NewSession, NewSignal, Peer, PeerClaim, PeerSlot, ResourceRef,
    Session, SessionKind, SessionStatus, Signal, SignalType,
};
pub use store::{RegistryError, SignalStore};
