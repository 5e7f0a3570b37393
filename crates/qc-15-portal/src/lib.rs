//! # QC-15 Portal
//!
//! Custodian collateral and cross-chain asset lifecycle engine.
//!
//! **Subsystem ID:** 15
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! Move public assets (BTC, BNB) in and out of the chain as pTokens backed by
//! over-collateralized custodians:
//! - Porting: a user sends public tokens to matched custodians and is minted pTokens
//! - Redeeming: a user burns pTokens and custodians return the public tokens
//! - Liquidation: under-collateralized or unresponsive custodians lose collateral
//! - Rewards: fees and an epoch reward are paid to custodians
//!
//! ## Determinism
//!
//! Every beacon node must derive the same instructions and state from the same
//! block. Maps are ordered, amounts are integers and fee rounding is the only
//! floating point.
//!
//! ## Module Structure
//!
//! ```text
//! qc-15-portal/
//! ├── domain/          # Custodians, requests, pool, errors, invariants
//! ├── algorithms/      # Rates, ledger, matching, liquidation, rewards, median
//! ├── application/     # Aggregate, processors, sweeps, PortalService
//! ├── ipc/             # Instruction records, action and result payloads
//! ├── ports/           # PortalApi, store, proof verifier, beacon timing, logger
//! └── adapters/        # In-memory store, block clock, tracing logger
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod algorithms;
pub mod application;
pub mod config;
pub mod domain;
pub mod ipc;
pub mod ports;

// Re-exports
pub use adapters::{BlockIntervalClock, InMemoryPortalStore, TracingLogger};
pub use application::{CurrentPortalState, PortalService};
pub use config::PortalParams;
pub use domain::{
    Amount, BridgeTokenDelta, CollateralTier, CustodianState, FinalExchangeRates,
    InstructionKind, InstructionStatus, PortalError, RedeemRequest, StatusRecord,
    WaitingPortingRequest, PRV_ID,
};
pub use ipc::{BlockResult, Instruction};
pub use ports::{
    ChainRetriever, PortalApi, PortalLogger, PortalSnapshot, PortalStateStore, ProofVerifier,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    #[allow(clippy::const_is_empty)]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}
