//! # Instruction Processors
//!
//! One processor per submitted action kind. [`processor_for`] is the
//! dispatch table; automatic kinds have no processor because the engine
//! emits them itself.
//!
//! A processor runs in two steps:
//!
//! 1. `prepare_data_before_processing` - read-only store checks
//! 2. `build_new_insts` - validate against the aggregate, mutate it and
//!    return the result instructions
//!
//! Business failures become `rejected` instructions. Errors returned from
//! `build_new_insts` abort the block.

mod custodian;
mod porting;
mod redeem;

pub use custodian::{
    CustodianDepositProcessor, CustodianTopupProcessor, CustodianWithdrawProcessor,
    TopupWaitingPortingProcessor, UnlockOverRateProcessor, WithdrawRewardProcessor,
};
pub use porting::{ExchangeRatesProcessor, PortingRequestProcessor, RequestPTokenProcessor};
pub use redeem::{
    RedeemFromPoolProcessor, RedeemRequestProcessor, ReqMatchingRedeemProcessor,
    RequestUnlockCollateralProcessor,
};

use super::state::CurrentPortalState;
use crate::config::PortalParams;
use crate::domain::{
    Amount, BridgeTokenDelta, InstructionKind, InstructionStatus, PortalError, RedeemRequest,
    StatusRecord, WaitingPortingRequest,
};
use crate::ipc::{ActionContent, ActionEnvelope, ActionOutcome, Instruction};
use crate::ports::outbound::{ChainRetriever, PortalLogger, PortalStateStore, ProofVerifier};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Results of the read-only pre-checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuxData {
    /// The action's unique ID was already accepted in an earlier block.
    pub unique_id_in_store: bool,
    /// The action's external transaction was already consumed.
    pub external_tx_used: bool,
}

/// Why an action was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// Human-readable reason.
    pub reason: String,
}

impl Rejection {
    /// Rejection with a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Outcome of validating and applying an action: the inner error is a
/// rejection, the outer one aborts the block.
pub type Checked<T> = Result<Result<T, Rejection>, PortalError>;

/// Split a state error into a rejection or a fatal error.
pub fn rejectable<T>(result: Result<T, PortalError>) -> Checked<T> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(e) if e.is_state_violation() => Err(e),
        Err(e) => Ok(Err(Rejection::new(e.to_string()))),
    }
}

/// Return a rejection from a [`Checked`] function unless `cond` holds.
macro_rules! ensure {
    ($cond:expr, $($reason:tt)+) => {
        if !$cond {
            return Ok(Err($crate::application::processors::Rejection::new(format!($($reason)+))));
        }
    };
}

/// Unwrap a [`Checked`] value or return its rejection.
macro_rules! checked {
    ($expr:expr) => {
        match $expr? {
            Ok(value) => value,
            Err(rejection) => return Ok(Err(rejection)),
        }
    };
}

pub(crate) use checked;
pub(crate) use ensure;

/// Writes and counters accumulated over one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockEffects {
    /// External transactions consumed this block.
    pub used_external_tx_ids: BTreeSet<String>,
    /// Porting IDs accepted this block.
    pub porting_ids: BTreeSet<String>,
    /// Redeem IDs accepted this block.
    pub redeem_ids: BTreeSet<String>,
    /// Status records in emission order.
    pub statuses: Vec<StatusRecord>,
    /// Bridge token movement per portal token.
    pub bridge_deltas: BTreeMap<String, BridgeTokenDelta>,
    /// Portings created this block, in acceptance order.
    pub new_portings: Vec<WaitingPortingRequest>,
    /// Redeems that became fully matched this block.
    pub newly_matched_redeems: Vec<RedeemRequest>,
}

impl BlockEffects {
    /// pTokens minted or returned to a user.
    pub fn count_up(&mut self, token: &str, amount: Amount) -> Result<(), PortalError> {
        let delta = self.bridge_deltas.entry(token.to_string()).or_default();
        delta.count_up_amount = delta
            .count_up_amount
            .checked_add(amount)
            .ok_or(PortalError::ArithmeticOverflow("bridge count up"))?;
        Ok(())
    }

    /// pTokens burned.
    pub fn deduct(&mut self, token: &str, amount: Amount) -> Result<(), PortalError> {
        let delta = self.bridge_deltas.entry(token.to_string()).or_default();
        delta.deduct_amount = delta
            .deduct_amount
            .checked_add(amount)
            .ok_or(PortalError::ArithmeticOverflow("bridge deduct"))?;
        Ok(())
    }

    /// Record the status of a request.
    pub fn record_status(&mut self, inst: &Instruction, id: &str) {
        self.statuses.push(StatusRecord {
            kind: inst.kind,
            id: id.to_string(),
            status: inst.status,
            content: inst.content.clone(),
        });
    }

    /// Whether an external transaction is spent, in the store or earlier
    /// in this block.
    pub fn is_external_tx_spent(&self, aux: &AuxData, tx_id: &str) -> bool {
        aux.external_tx_used || self.used_external_tx_ids.contains(tx_id)
    }
}

/// Collaborators and accumulated effects for one block.
pub struct BlockContext<'a> {
    /// Beacon height being processed.
    pub beacon_height: u64,
    /// Protocol parameters.
    pub params: &'a PortalParams,
    /// Beacon timing.
    pub chain: &'a dyn ChainRetriever,
    /// External-chain proof verification.
    pub verifier: &'a dyn ProofVerifier,
    /// Diagnostics.
    pub logger: &'a dyn PortalLogger,
    /// Effects so far.
    pub effects: BlockEffects,
}

impl<'a> BlockContext<'a> {
    /// Fresh context for a block.
    pub fn new(
        beacon_height: u64,
        params: &'a PortalParams,
        chain: &'a dyn ChainRetriever,
        verifier: &'a dyn ProofVerifier,
        logger: &'a dyn PortalLogger,
    ) -> Self {
        Self {
            beacon_height,
            params,
            chain,
            verifier,
            logger,
            effects: BlockEffects::default(),
        }
    }

    /// Whether `timeout_secs` have passed since a request stored at
    /// `since_height`.
    pub fn is_timed_out(&self, since_height: u64, timeout_secs: u64) -> bool {
        self.chain
            .is_block_time_reached(self.beacon_height + 1, since_height, timeout_secs)
    }
}

/// Builds the result instructions of one action.
pub(crate) struct Reply<'r, T> {
    kind: InstructionKind,
    shard_id: u8,
    tx_req_id: &'r str,
    status_id: &'r str,
    action: &'r T,
}

impl<'r, T: Serialize> Reply<'r, T> {
    pub(crate) fn new(
        kind: InstructionKind,
        shard_id: u8,
        envelope: &'r ActionEnvelope,
        status_id: &'r str,
        action: &'r T,
    ) -> Self {
        Self {
            kind,
            shard_id,
            tx_req_id: &envelope.tx_req_id,
            status_id,
            action,
        }
    }

    fn emit(
        &self,
        ctx: &mut BlockContext<'_>,
        status: InstructionStatus,
        outcome: ActionOutcome,
    ) -> Result<Instruction, PortalError> {
        let content = ActionContent {
            tx_req_id: self.tx_req_id.to_string(),
            action: self.action,
            outcome,
        };
        let inst = Instruction::new(self.kind, self.shard_id, status, &content)?;
        ctx.effects.record_status(&inst, self.status_id);
        Ok(inst)
    }

    /// Emit `accepted`.
    pub(crate) fn accept(
        &self,
        ctx: &mut BlockContext<'_>,
        outcome: ActionOutcome,
    ) -> Result<Vec<Instruction>, PortalError> {
        ctx.logger.infof(format_args!(
            "[qc-15] {:?} {} accepted",
            self.kind, self.status_id
        ));
        Ok(vec![self.emit(ctx, InstructionStatus::Accepted, outcome)?])
    }

    /// Emit `rejected` with the reason attached.
    pub(crate) fn reject(
        &self,
        ctx: &mut BlockContext<'_>,
        rejection: Rejection,
    ) -> Result<Vec<Instruction>, PortalError> {
        ctx.logger.warnf(format_args!(
            "[qc-15] {:?} {} rejected: {}",
            self.kind, self.status_id, rejection
        ));
        let outcome = ActionOutcome {
            reason: Some(rejection.reason),
            ..Default::default()
        };
        Ok(vec![self.emit(ctx, InstructionStatus::Rejected, outcome)?])
    }

    /// Emit `accepted` or `rejected` from a [`Checked`] result.
    pub(crate) fn settle(
        &self,
        ctx: &mut BlockContext<'_>,
        checked: Checked<ActionOutcome>,
    ) -> Result<Vec<Instruction>, PortalError> {
        match checked? {
            Ok(outcome) => self.accept(ctx, outcome),
            Err(rejection) => self.reject(ctx, rejection),
        }
    }
}

/// A processor for one submitted action kind.
pub trait PortalInstructionProcessor: Send + Sync {
    /// Kind handled.
    fn kind(&self) -> InstructionKind;

    /// Read-only store checks, run before the aggregate is touched.
    fn prepare_data_before_processing(
        &self,
        _store: &dyn PortalStateStore,
        _envelope: &ActionEnvelope,
    ) -> Result<AuxData, PortalError> {
        Ok(AuxData::default())
    }

    /// Validate and apply the action, returning result instructions.
    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError>;
}

/// Processor for a kind; `None` for kinds the engine emits itself.
pub fn processor_for(kind: InstructionKind) -> Option<&'static dyn PortalInstructionProcessor> {
    match kind {
        InstructionKind::CustodianDeposit => Some(&CustodianDepositProcessor),
        InstructionKind::CustodianWithdraw => Some(&CustodianWithdrawProcessor),
        InstructionKind::PortingRequest => Some(&PortingRequestProcessor),
        InstructionKind::RequestPToken => Some(&RequestPTokenProcessor),
        InstructionKind::ExchangeRates => Some(&ExchangeRatesProcessor),
        InstructionKind::RedeemRequest => Some(&RedeemRequestProcessor),
        InstructionKind::ReqMatchingRedeem => Some(&ReqMatchingRedeemProcessor),
        InstructionKind::RequestUnlockCollateral => Some(&RequestUnlockCollateralProcessor),
        InstructionKind::RedeemFromLiquidationPool => Some(&RedeemFromPoolProcessor),
        InstructionKind::CustodianTopup => Some(&CustodianTopupProcessor),
        InstructionKind::TopupWaitingPorting => Some(&TopupWaitingPortingProcessor),
        InstructionKind::UnlockOverRateCollaterals => Some(&UnlockOverRateProcessor),
        InstructionKind::RequestWithdrawReward => Some(&WithdrawRewardProcessor),
        InstructionKind::ExpiredWaitingPorting
        | InstructionKind::Reward
        | InstructionKind::TotalCustodianReward
        | InstructionKind::PickMoreCustodianForRedeem
        | InstructionKind::LiquidateCustodian
        | InstructionKind::LiquidateByRates
        | InstructionKind::LiquidationCancelledRedeem => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::adapters::{BlockIntervalClock, InMemoryPortalStore};
    use crate::domain::{FinalExchangeRates, PORTAL_BTC_ID, PRV_ID, USDT_ID};
    use crate::ports::outbound::{MockProofVerifier, RecordingLogger};

    pub const PBTC: &str = PORTAL_BTC_ID;

    /// PRV at 1, pBTC at 50 PRV, USDT at 1 per whole unit.
    pub fn rates() -> FinalExchangeRates {
        FinalExchangeRates {
            rates: BTreeMap::from([
                (PRV_ID.to_string(), 1_000_000),
                (PBTC.to_string(), 50_000_000),
                (USDT_ID.to_string(), 1_000_000),
            ]),
        }
    }

    pub struct Harness {
        pub params: PortalParams,
        pub chain: BlockIntervalClock,
        pub verifier: MockProofVerifier,
        pub logger: RecordingLogger,
        pub store: InMemoryPortalStore,
        pub state: CurrentPortalState,
    }

    impl Harness {
        pub fn new() -> Self {
            let params = PortalParams::default();
            Self {
                chain: BlockIntervalClock::new(params.beacon_block_interval_secs),
                params,
                verifier: MockProofVerifier::default(),
                logger: RecordingLogger::new(),
                store: InMemoryPortalStore::new(),
                state: CurrentPortalState {
                    final_exchange_rates: Some(rates()),
                    ..Default::default()
                },
            }
        }

        pub fn custodian(&mut self, address: &str, prv: Amount) {
            let remote = BTreeMap::from([(PBTC.to_string(), format!("btc-{address}"))]);
            self.state
                .deposit_collateral(address, PRV_ID, prv, &remote)
                .unwrap();
        }

        /// Run one action through a processor, returning the instructions
        /// and the block effects.
        pub fn run<T: Serialize>(
            &mut self,
            kind: InstructionKind,
            tx_req_id: &str,
            meta: &T,
        ) -> (Vec<Instruction>, BlockEffects) {
            self.run_at(10, kind, tx_req_id, meta)
        }

        pub fn run_at<T: Serialize>(
            &mut self,
            beacon_height: u64,
            kind: InstructionKind,
            tx_req_id: &str,
            meta: &T,
        ) -> (Vec<Instruction>, BlockEffects) {
            let envelope = ActionEnvelope {
                tx_req_id: tx_req_id.to_string(),
                meta: serde_json::to_value(meta).unwrap(),
            };
            let processor = processor_for(kind).unwrap();
            let aux = processor
                .prepare_data_before_processing(&self.store, &envelope)
                .unwrap();
            let mut ctx = BlockContext::new(
                beacon_height,
                &self.params,
                &self.chain,
                &self.verifier,
                &self.logger,
            );
            let insts = processor
                .build_new_insts(&mut ctx, &mut self.state, &envelope, 0, &aux)
                .unwrap();
            (insts, ctx.effects)
        }
    }

    pub fn status_of(insts: &[Instruction]) -> InstructionStatus {
        assert_eq!(insts.len(), 1);
        insts[0].status
    }
}
