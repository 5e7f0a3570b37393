//! # Application Layer
//!
//! The block pipeline: the in-memory aggregate, per-action processors,
//! automatic sweeps and the service that runs a beacon block end to end.

pub mod processors;
pub mod service;
pub mod state;
pub mod sweeps;

pub use processors::{
    processor_for, AuxData, BlockContext, BlockEffects, PortalInstructionProcessor, Rejection,
};
pub use service::PortalService;
pub use state::{CurrentPortalState, CustodianPosition};
