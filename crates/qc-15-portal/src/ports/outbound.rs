//! # Outbound Ports
//!
//! Traits for external dependencies: the state store, external-chain proof
//! verification, beacon timing and diagnostics.

use crate::domain::{
    Amount, CustodianState, FinalExchangeRates, InstructionKind, LiquidationPool,
    LockedCollateralState, PortalError, RedeemRequest, StatusRecord, WaitingPortingRequest,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Everything the engine persists between beacon blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSnapshot {
    /// Custodian pool by address.
    pub custodians: BTreeMap<String, CustodianState>,
    /// Waiting portings by unique ID.
    pub waiting_portings: BTreeMap<String, WaitingPortingRequest>,
    /// Waiting redeems by unique ID.
    pub waiting_redeems: BTreeMap<String, RedeemRequest>,
    /// Matched redeems by unique ID.
    pub matched_redeems: BTreeMap<String, RedeemRequest>,
    /// Final exchange rates, absent until the first submission.
    pub final_exchange_rates: Option<FinalExchangeRates>,
    /// Liquidation pool.
    pub liquidation_pool: LiquidationPool,
    /// Locked collateral valuation for the current reward epoch.
    pub locked_collateral: LockedCollateralState,
    /// Warning-tier ratios by custodian then portal token.
    pub ratio_warnings: BTreeMap<String, BTreeMap<String, u128>>,
}

/// Writes produced by one beacon block, applied together.
#[derive(Clone, Debug, Default)]
pub struct BlockCommit {
    /// Beacon height processed.
    pub beacon_height: u64,
    /// New aggregate state.
    pub snapshot: PortalSnapshot,
    /// External transaction IDs consumed this block.
    pub used_external_tx_ids: Vec<String>,
    /// Porting IDs accepted this block.
    pub porting_ids: Vec<String>,
    /// Redeem IDs accepted this block.
    pub redeem_ids: Vec<String>,
    /// Status records for external query.
    pub statuses: Vec<StatusRecord>,
}

/// Portal state store - outbound port.
///
/// Reads are issued while the aggregate is built and by the read-only
/// pre-checks; the only write is [`PortalStateStore::commit_block`].
pub trait PortalStateStore: Send + Sync {
    /// Load the state persisted by the previous block.
    fn load_snapshot(&self) -> Result<PortalSnapshot, PortalError>;

    /// Persist a block's writes as one unit.
    fn commit_block(&self, commit: BlockCommit) -> Result<(), PortalError>;

    /// Whether an external transaction has already been consumed.
    fn is_external_tx_used(&self, tx_id: &str) -> Result<bool, PortalError>;

    /// Whether a porting ID was ever accepted.
    fn porting_id_exists(&self, porting_id: &str) -> Result<bool, PortalError>;

    /// Whether a redeem ID was ever accepted.
    fn redeem_id_exists(&self, redeem_id: &str) -> Result<bool, PortalError>;

    /// Status record by kind and request ID.
    fn get_status(
        &self,
        kind: InstructionKind,
        id: &str,
    ) -> Result<Option<StatusRecord>, PortalError>;
}

/// What an external-chain proof is claimed to show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofClaim {
    /// Portal token or collateral asset the proof concerns.
    pub token_id: String,
    /// Porting ID, redeem ID or deposit reference carried in the memo.
    pub unique_id: String,
    /// Encoded proof.
    pub proof: String,
    /// Expected (receiver, amount) outputs.
    pub receivers: Vec<(String, Amount)>,
}

/// External-chain proof verification - outbound port.
pub trait ProofVerifier: Send + Sync {
    /// Verdict for a claim. Errors are reserved for verifier failures.
    fn verify(&self, claim: &ProofClaim) -> Result<bool, PortalError>;
}

/// Beacon chain timing - outbound port.
pub trait ChainRetriever: Send + Sync {
    /// Whether `timeout_secs` have elapsed between two beacon heights.
    fn is_block_time_reached(&self, current_height: u64, since_height: u64, timeout_secs: u64)
        -> bool;
}

/// Injected diagnostics sink.
pub trait PortalLogger: Send + Sync {
    /// Informational message.
    fn infof(&self, args: fmt::Arguments<'_>);

    /// Something unexpected that does not stop processing.
    fn warnf(&self, args: fmt::Arguments<'_>);

    /// A failure.
    fn errorf(&self, args: fmt::Arguments<'_>);
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

/// Mock proof verifier for testing.
#[derive(Clone, Debug)]
pub struct MockProofVerifier {
    /// Verdict returned for every claim.
    pub valid: bool,
    /// Should fail?
    pub should_fail: bool,
}

impl Default for MockProofVerifier {
    fn default() -> Self {
        Self {
            valid: true,
            should_fail: false,
        }
    }
}

impl ProofVerifier for MockProofVerifier {
    fn verify(&self, _claim: &ProofClaim) -> Result<bool, PortalError> {
        if self.should_fail {
            return Err(PortalError::Store("Mock verifier failure".to_string()));
        }
        Ok(self.valid)
    }
}

/// Severity of a recorded log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    /// `infof`
    Info,
    /// `warnf`
    Warn,
    /// `errorf`
    Error,
}

/// Logger that keeps every line, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded lines.
    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }

    /// Whether a line at `level` contains `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lines
            .lock()
            .iter()
            .any(|(l, line)| *l == level && line.contains(needle))
    }
}

impl PortalLogger for RecordingLogger {
    fn infof(&self, args: fmt::Arguments<'_>) {
        self.lines.lock().push((LogLevel::Info, args.to_string()));
    }

    fn warnf(&self, args: fmt::Arguments<'_>) {
        self.lines.lock().push((LogLevel::Warn, args.to_string()));
    }

    fn errorf(&self, args: fmt::Arguments<'_>) {
        self.lines.lock().push((LogLevel::Error, args.to_string()));
    }
}
