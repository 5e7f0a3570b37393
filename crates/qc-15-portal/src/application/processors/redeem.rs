//! Redeem actions: requests, custodian opt-in, unlock and pool redemption.

use super::{
    checked, ensure, rejectable, AuxData, BlockContext, Checked, PortalInstructionProcessor,
    Rejection, Reply,
};
use crate::algorithms::{match_custodian_to_waiting_redeem, ExchangeRateTool};
use crate::application::state::CurrentPortalState;
use crate::domain::{
    InstructionKind, MatchingRedeemCustodianDetail, PortalError, RedeemRequest,
};
use crate::ipc::{
    ActionEnvelope, ActionOutcome, Instruction, RedeemFromPoolAction, RedeemRequestAction,
    ReqMatchingRedeemAction, RequestUnlockCollateralAction,
};
use crate::ports::outbound::{PortalStateStore, ProofClaim};

// =============================================================================
// Redeem request
// =============================================================================

/// User burns pTokens and waits for custodians to return the public asset.
pub struct RedeemRequestProcessor;

impl RedeemRequestProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        action: &RedeemRequestAction,
        shard_id: u8,
        aux: &AuxData,
    ) -> Checked<ActionOutcome> {
        let params = ctx.params;
        let id = &action.unique_redeem_id;
        ensure!(!id.is_empty(), "empty redeem id");
        ensure!(
            !aux.unique_id_in_store
                && !state.redeem_in_flight(id)
                && !ctx.effects.redeem_ids.contains(id),
            "redeem id {id} already used"
        );
        ensure!(
            params.is_portal_token(&action.token_id),
            "unknown portal token {}",
            action.token_id
        );
        ensure!(action.redeem_amount > 0, "redeem amount is zero");
        ensure!(!action.remote_address.is_empty(), "empty remote address");

        let rates = checked!(rejectable(state.current_rates()));
        let tool = ExchangeRateTool::new(&rates, params);
        let min_fee = checked!(rejectable(tool.portal_fee(
            &action.token_id,
            action.redeem_amount,
            params.min_percent_redeem_fee,
            params.min_portal_fee,
        )));
        ensure!(
            action.redeem_fee >= min_fee,
            "redeem fee {} below minimum {min_fee}",
            action.redeem_fee
        );

        state.add_waiting_redeem(RedeemRequest {
            unique_redeem_id: id.clone(),
            tx_req_id: envelope.tx_req_id.clone(),
            token_id: action.token_id.clone(),
            redeemer_address: action.redeemer_address.clone(),
            redeemer_remote_address: action.remote_address.clone(),
            redeemer_external_address: action.redeemer_external_address.clone(),
            redeem_amount: action.redeem_amount,
            custodians: Vec::new(),
            redeem_fee: action.redeem_fee,
            beacon_height: ctx.beacon_height + 1,
            shard_id,
        });
        ctx.effects.redeem_ids.insert(id.clone());
        ctx.effects.deduct(&action.token_id, action.redeem_amount)?;
        Ok(Ok(ActionOutcome::default()))
    }
}

impl PortalInstructionProcessor for RedeemRequestProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::RedeemRequest
    }

    fn prepare_data_before_processing(
        &self,
        store: &dyn PortalStateStore,
        envelope: &ActionEnvelope,
    ) -> Result<AuxData, PortalError> {
        let action: RedeemRequestAction = envelope.meta_as()?;
        Ok(AuxData {
            unique_id_in_store: store.redeem_id_exists(&action.unique_redeem_id)?,
            ..Default::default()
        })
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: RedeemRequestAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &action.unique_redeem_id, &action);
        let checked = Self::apply(ctx, state, envelope, &action, shard_id, aux);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Custodian opt-in
// =============================================================================

/// Custodian volunteers its holdings for a waiting redeem.
pub struct ReqMatchingRedeemProcessor;

impl ReqMatchingRedeemProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        action: &ReqMatchingRedeemAction,
    ) -> Checked<ActionOutcome> {
        let Some(redeem) = state.waiting_redeem(&action.redeem_id) else {
            return Ok(Err(Rejection::new(format!(
                "waiting redeem {} not found",
                action.redeem_id
            ))));
        };
        ensure!(
            redeem.share_of(&action.custodian_address) == 0,
            "custodian {} already matched to {}",
            action.custodian_address,
            action.redeem_id
        );
        let (amount, is_full) = checked!(rejectable(match_custodian_to_waiting_redeem(
            &action.custodian_address,
            &action.redeem_id,
            state.waiting_redeems(),
            state.custodians(),
        )));
        let remote_address = state
            .custodian(&action.custodian_address)
            .and_then(|c| c.remote_addresses.get(&redeem.token_id).cloned())
            .unwrap_or_default();

        checked!(rejectable(state.match_waiting_redeem(
            &action.redeem_id,
            MatchingRedeemCustodianDetail {
                incognito_address: action.custodian_address.clone(),
                remote_address,
                amount,
            },
            is_full,
        )));
        if is_full {
            if let Some(matched) = state.matched_redeem(&action.redeem_id) {
                ctx.effects.newly_matched_redeems.push(matched.clone());
            }
        }
        Ok(Ok(ActionOutcome {
            matched_amount: Some(amount),
            is_fully_matched: Some(is_full),
            ..Default::default()
        }))
    }
}

impl PortalInstructionProcessor for ReqMatchingRedeemProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::ReqMatchingRedeem
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: ReqMatchingRedeemAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, &action);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Unlock collateral
// =============================================================================

/// Custodian proves it paid out its redeem share and gets collateral back.
pub struct RequestUnlockCollateralProcessor;

impl RequestUnlockCollateralProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        action: &RequestUnlockCollateralAction,
    ) -> Checked<ActionOutcome> {
        let id = &action.unique_redeem_id;
        let custodian = &action.custodian_address;
        let Some(redeem) = state.matched_redeem(id) else {
            return Ok(Err(Rejection::new(format!("matched redeem {id} not found"))));
        };
        ensure!(
            redeem.token_id == action.token_id,
            "redeem {id} is for {}",
            redeem.token_id
        );
        let Some(detail) = redeem
            .custodians
            .iter()
            .find(|d| &d.incognito_address == custodian)
        else {
            return Ok(Err(Rejection::new(format!(
                "custodian {custodian} not matched to {id}"
            ))));
        };
        ensure!(
            detail.amount == action.redeem_amount,
            "custodian {custodian} share of {id} is {}",
            detail.amount
        );
        let claim = ProofClaim {
            token_id: redeem.token_id.clone(),
            unique_id: id.clone(),
            proof: action.redeem_proof.clone(),
            receivers: vec![(redeem.redeemer_remote_address.clone(), detail.amount)],
        };
        ensure!(ctx.verifier.verify(&claim)?, "invalid redeem proof");

        let rates = checked!(rejectable(state.current_rates()));
        let tool = ExchangeRateTool::new(&rates, ctx.params);
        let released = checked!(rejectable(state.unlock_after_redeem(&tool, id, custodian)));
        Ok(Ok(ActionOutcome {
            released_collaterals: released,
            ..Default::default()
        }))
    }
}

impl PortalInstructionProcessor for RequestUnlockCollateralProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::RequestUnlockCollateral
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: RequestUnlockCollateralAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, &action);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Redeem from liquidation pool
// =============================================================================

/// User burns pTokens against the liquidation pool for seized collateral.
pub struct RedeemFromPoolProcessor;

impl RedeemFromPoolProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        action: &RedeemFromPoolAction,
    ) -> Checked<ActionOutcome> {
        ensure!(
            ctx.params.is_portal_token(&action.token_id),
            "unknown portal token {}",
            action.token_id
        );
        ensure!(action.redeem_amount > 0, "redeem amount is zero");
        let rates = checked!(rejectable(state.current_rates()));
        let tool = ExchangeRateTool::new(&rates, ctx.params);
        let released = checked!(rejectable(state.redeem_from_pool(
            &tool,
            &action.token_id,
            action.redeem_amount
        )));
        ctx.effects.deduct(&action.token_id, action.redeem_amount)?;
        Ok(Ok(ActionOutcome {
            released_collaterals: released,
            ..Default::default()
        }))
    }
}

impl PortalInstructionProcessor for RedeemFromPoolProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::RedeemFromLiquidationPool
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: RedeemFromPoolAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, &action);
        reply.settle(ctx, checked)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{status_of, Harness, PBTC};
    use super::*;
    use crate::domain::{InstructionStatus, LiquidationPoolDetail, PRV_ID};
    use crate::ipc::{ActionContent, PortingRequestAction, RequestPTokenAction};

    /// `cus1` holds 100 pBTC backed by 7500 PRV.
    fn ported() -> Harness {
        let mut h = Harness::new();
        h.custodian("cus1", 100_000);
        h.run(
            InstructionKind::PortingRequest,
            "tx-port",
            &PortingRequestAction {
                unique_register_id: "p1".into(),
                incognito_address: "user".into(),
                token_id: PBTC.into(),
                register_amount: 100,
                porting_fee: 100,
            },
        );
        h.run(
            InstructionKind::RequestPToken,
            "tx-ptoken",
            &RequestPTokenAction {
                unique_porting_id: "p1".into(),
                token_id: PBTC.into(),
                incognito_address: "user".into(),
                porting_amount: 100,
                porting_proof: "proof".into(),
            },
        );
        h
    }

    fn redeem(id: &str, amount: u64) -> RedeemRequestAction {
        RedeemRequestAction {
            unique_redeem_id: id.into(),
            token_id: PBTC.into(),
            redeem_amount: amount,
            redeemer_address: "user".into(),
            remote_address: "btc-user".into(),
            redeemer_external_address: String::new(),
            redeem_fee: 100,
        }
    }

    fn opt_in(redeem_id: &str) -> ReqMatchingRedeemAction {
        ReqMatchingRedeemAction {
            custodian_address: "cus1".into(),
            redeem_id: redeem_id.into(),
        }
    }

    #[test]
    fn test_burn_overflow_aborts_block() {
        let mut h = Harness::new();
        h.state.final_exchange_rates = Some(crate::domain::FinalExchangeRates {
            rates: std::collections::BTreeMap::from([
                (PRV_ID.to_string(), 1_000_000),
                (PBTC.to_string(), 1),
            ]),
        });
        let processor = super::super::processor_for(InstructionKind::RedeemRequest).unwrap();
        let mut ctx =
            super::super::BlockContext::new(10, &h.params, &h.chain, &h.verifier, &h.logger);

        let half = 1u64 << 63;
        let mut results = Vec::new();
        for (tx, id) in [("tx1", "r1"), ("tx2", "r2")] {
            let mut action = redeem(id, half);
            action.redeem_fee = 1 << 40;
            let envelope = ActionEnvelope {
                tx_req_id: tx.into(),
                meta: serde_json::to_value(action).unwrap(),
            };
            let aux = processor
                .prepare_data_before_processing(&h.store, &envelope)
                .unwrap();
            results.push(processor.build_new_insts(&mut ctx, &mut h.state, &envelope, 0, &aux));
        }

        let first = results.remove(0).unwrap();
        assert_eq!(status_of(&first), InstructionStatus::Accepted);
        let err = results.remove(0).unwrap_err();
        assert!(matches!(err, PortalError::ArithmeticOverflow(_)));
        assert!(err.is_state_violation());
        assert_eq!(ctx.effects.bridge_deltas[PBTC].deduct_amount, half);
    }

    #[test]
    fn test_redeem_request() {
        let mut h = ported();
        let (insts, effects) = h.run(InstructionKind::RedeemRequest, "tx1", &redeem("r1", 40));
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        let waiting = h.state.waiting_redeem("r1").unwrap();
        assert_eq!(waiting.beacon_height, 11);
        assert!(waiting.custodians.is_empty());
        assert_eq!(effects.bridge_deltas[PBTC].deduct_amount, 40);

        let (insts, _) = h.run(InstructionKind::RedeemRequest, "tx2", &redeem("r1", 40));
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);

        let mut cheap = redeem("r2", 40);
        cheap.redeem_fee = 10;
        let (insts, effects) = h.run(InstructionKind::RedeemRequest, "tx3", &cheap);
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
        assert!(effects.bridge_deltas.is_empty());
    }

    #[test]
    fn test_redeem_id_in_store_rejected() {
        let mut h = ported();
        h.store.mark_redeem_id_used("r1");
        let (insts, _) = h.run(InstructionKind::RedeemRequest, "tx1", &redeem("r1", 40));
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
    }

    #[test]
    fn test_custodian_opt_in_and_unlock() {
        let mut h = ported();
        h.run(InstructionKind::RedeemRequest, "tx1", &redeem("r1", 40));
        let (insts, effects) = h.run(InstructionKind::ReqMatchingRedeem, "tx2", &opt_in("r1"));
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        assert_eq!(effects.newly_matched_redeems[0].unique_redeem_id, "r1");
        let matched = h.state.matched_redeem("r1").unwrap();
        assert_eq!(matched.custodians[0].remote_address, "btc-cus1");
        assert_eq!(h.state.custodian("cus1").unwrap().holding_of(PBTC), 60);

        let mut unlock = RequestUnlockCollateralAction {
            unique_redeem_id: "r1".into(),
            token_id: PBTC.into(),
            custodian_address: "cus1".into(),
            redeem_amount: 39,
            redeem_proof: "proof".into(),
        };
        let (insts, _) = h.run(InstructionKind::RequestUnlockCollateral, "tx3", &unlock);
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);

        unlock.redeem_amount = 40;
        let (insts, _) = h.run(InstructionKind::RequestUnlockCollateral, "tx4", &unlock);
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        // 40 of 100 held pBTC frees 40% of the 7500 PRV
        let content: ActionContent<RequestUnlockCollateralAction> =
            insts[0].content_as().unwrap();
        assert_eq!(content.outcome.released_collaterals[PRV_ID], 3000);
        let custodian = h.state.custodian("cus1").unwrap();
        assert_eq!(custodian.locked_of(PBTC, PRV_ID), 4500);
        assert!(h.state.matched_redeem("r1").is_none());
    }

    #[test]
    fn test_partial_opt_in_stays_waiting() {
        let mut h = ported();
        h.run(InstructionKind::RedeemRequest, "tx1", &redeem("r1", 150));
        let (insts, effects) = h.run(InstructionKind::ReqMatchingRedeem, "tx2", &opt_in("r1"));
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        assert!(effects.newly_matched_redeems.is_empty());
        assert_eq!(h.state.waiting_redeem("r1").unwrap().matched_amount(), 100);

        let (insts, _) = h.run(InstructionKind::ReqMatchingRedeem, "tx3", &opt_in("r1"));
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
    }

    #[test]
    fn test_unlock_rejected_with_bad_proof() {
        let mut h = ported();
        h.run(InstructionKind::RedeemRequest, "tx1", &redeem("r1", 40));
        h.run(InstructionKind::ReqMatchingRedeem, "tx2", &opt_in("r1"));
        h.verifier.valid = false;
        let unlock = RequestUnlockCollateralAction {
            unique_redeem_id: "r1".into(),
            token_id: PBTC.into(),
            custodian_address: "cus1".into(),
            redeem_amount: 40,
            redeem_proof: "forged".into(),
        };
        let (insts, _) = h.run(InstructionKind::RequestUnlockCollateral, "tx3", &unlock);
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
        assert!(h.state.matched_redeem("r1").is_some());
    }

    #[test]
    fn test_redeem_from_pool() {
        let mut h = Harness::new();
        h.state.liquidation_pool.rates.insert(
            PBTC.to_string(),
            LiquidationPoolDetail {
                collateral_amount: 6000,
                pub_token_amount: 100,
                ..Default::default()
            },
        );
        let action = RedeemFromPoolAction {
            token_id: PBTC.into(),
            redeem_amount: 10,
            redeemer_address: "user".into(),
            redeemer_external_address: String::new(),
        };
        let (insts, effects) = h.run(InstructionKind::RedeemFromLiquidationPool, "tx1", &action);
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        assert_eq!(effects.bridge_deltas[PBTC].deduct_amount, 10);
        let pool = &h.state.liquidation_pool().rates[PBTC];
        assert_eq!(pool.collateral_amount, 5400);
        assert_eq!(pool.pub_token_amount, 90);

        let too_much = RedeemFromPoolAction {
            redeem_amount: 91,
            ..action
        };
        let (insts, _) = h.run(InstructionKind::RedeemFromLiquidationPool, "tx2", &too_much);
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
    }
}
