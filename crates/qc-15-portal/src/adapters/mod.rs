//! # Adapters Layer (Hexagonal Architecture)
//!
//! Implements the outbound port traits: state store, beacon timing and
//! diagnostics.

mod chain_clock;
mod logger;
mod state_store;

pub use chain_clock::BlockIntervalClock;
pub use logger::TracingLogger;
pub use state_store::{storage_key, InMemoryPortalStore};
