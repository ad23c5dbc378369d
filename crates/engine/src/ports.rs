//! Port definitions — traits that adapters implement.
//!
//! Ports are the boundary between the engine and the outside world.
//! The engine never knows *how* states are persisted or transported;
//! it only consumes these traits and the change-notification stream.

pub mod state_store;

pub use state_store::{StateStore, StoreEvent};
