//! # Inbound Ports
//!
//! API trait defining what the Portal subsystem can do.

use crate::domain::{CustodianState, FinalExchangeRates, InstructionKind, PortalError, StatusRecord};
use crate::ipc::BlockResult;
use crate::ports::outbound::PortalSnapshot;
use async_trait::async_trait;

/// Portal API - inbound port.
#[async_trait]
pub trait PortalApi: Send + Sync {
    /// Process one beacon block's Portal instruction records.
    ///
    /// Records are `[metadata type, shard id, status, payload]`. The
    /// returned instructions and the persisted state depend only on the
    /// previous state and `records`.
    async fn process_block(
        &self,
        beacon_height: u64,
        records: &[Vec<String>],
    ) -> Result<BlockResult, PortalError>;

    /// Custodian by address.
    fn custodian(&self, address: &str) -> Result<Option<CustodianState>, PortalError>;

    /// Status of a request.
    fn status(&self, kind: InstructionKind, id: &str) -> Result<Option<StatusRecord>, PortalError>;

    /// Current final exchange rates.
    fn final_exchange_rates(&self) -> Result<Option<FinalExchangeRates>, PortalError>;

    /// Full persisted state.
    fn snapshot(&self) -> Result<PortalSnapshot, PortalError>;
}
