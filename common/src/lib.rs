//! Shared records for the rknet allocation service.
//!
//! These types are persisted by the store backends and carried over the wire
//! between network hosts, so every field must round-trip through both
//! `serde_json` and `bincode`.

mod instance;
mod model;
mod network;

pub use instance::*;
pub use model::*;
pub use network::*;
