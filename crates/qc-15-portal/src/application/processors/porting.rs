//! Porting actions and exchange rate submissions.

use super::{
    checked, ensure, rejectable, AuxData, BlockContext, Checked, PortalInstructionProcessor,
    Rejection, Reply,
};
use crate::algorithms::{pick_custodians_for_porting, ExchangeRateTool, PortingPickParams};
use crate::application::state::CurrentPortalState;
use crate::domain::{
    invariant_porting_allocation_complete, ExchangeRatesRequest, InstructionKind, PortalError,
    WaitingPortingRequest, PRV_ID,
};
use crate::ipc::{
    ActionEnvelope, ActionOutcome, ExchangeRatesAction, Instruction, PortingRequestAction,
    RequestPTokenAction,
};
use crate::ports::outbound::{PortalStateStore, ProofClaim};

// =============================================================================
// Porting request
// =============================================================================

/// User asks to port an external asset.
pub struct PortingRequestProcessor;

impl PortingRequestProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        action: &PortingRequestAction,
        shard_id: u8,
        aux: &AuxData,
    ) -> Checked<ActionOutcome> {
        let params = ctx.params;
        let id = &action.unique_register_id;
        ensure!(!id.is_empty(), "empty porting id");
        ensure!(
            !aux.unique_id_in_store
                && state.waiting_porting(id).is_none()
                && !ctx.effects.porting_ids.contains(id),
            "porting id {id} already used"
        );
        ensure!(
            params.is_portal_token(&action.token_id),
            "unknown portal token {}",
            action.token_id
        );
        ensure!(action.register_amount > 0, "porting amount is zero");

        let rates = checked!(rejectable(state.current_rates()));
        let tool = ExchangeRateTool::new(&rates, params);
        let min_fee = checked!(rejectable(tool.portal_fee(
            &action.token_id,
            action.register_amount,
            params.min_percent_porting_fee,
            params.min_portal_fee,
        )));
        ensure!(
            action.porting_fee >= min_fee,
            "porting fee {} below minimum {min_fee}",
            action.porting_fee
        );

        let custodians = checked!(rejectable(pick_custodians_for_porting(&PortingPickParams {
            token_id: &action.token_id,
            amount: action.register_amount,
            custodians: state.custodians(),
            tool: &tool,
            min_percent_locked_collateral: params.min_percent_locked_collateral,
        })));

        let porting = WaitingPortingRequest {
            unique_porting_id: id.clone(),
            tx_req_id: envelope.tx_req_id.clone(),
            token_id: action.token_id.clone(),
            porter_address: action.incognito_address.clone(),
            amount: action.register_amount,
            custodians: custodians.clone(),
            porting_fee: action.porting_fee,
            beacon_height: ctx.beacon_height + 1,
            shard_id,
        };
        if !invariant_porting_allocation_complete(&porting) {
            return Err(PortalError::ConsistencyViolation(format!(
                "porting {id} allocation does not sum to {}",
                action.register_amount
            )));
        }
        checked!(rejectable(state.add_waiting_porting(porting.clone())));
        ctx.effects.porting_ids.insert(id.clone());
        ctx.effects.new_portings.push(porting);
        Ok(Ok(ActionOutcome {
            porting_custodians: custodians,
            ..Default::default()
        }))
    }
}

impl PortalInstructionProcessor for PortingRequestProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::PortingRequest
    }

    fn prepare_data_before_processing(
        &self,
        store: &dyn PortalStateStore,
        envelope: &ActionEnvelope,
    ) -> Result<AuxData, PortalError> {
        let action: PortingRequestAction = envelope.meta_as()?;
        Ok(AuxData {
            unique_id_in_store: store.porting_id_exists(&action.unique_register_id)?,
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
        let action: PortingRequestAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &action.unique_register_id, &action);
        let checked = Self::apply(ctx, state, envelope, &action, shard_id, aux);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Request pToken
// =============================================================================

/// User proves delivery to the matched custodians and receives pTokens.
pub struct RequestPTokenProcessor;

impl RequestPTokenProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        action: &RequestPTokenAction,
    ) -> Checked<ActionOutcome> {
        let id = &action.unique_porting_id;
        let Some(porting) = state.waiting_porting(id) else {
            return Ok(Err(Rejection::new(format!("waiting porting {id} not found"))));
        };
        ensure!(
            porting.token_id == action.token_id,
            "porting {id} is for {}",
            porting.token_id
        );
        ensure!(
            porting.porter_address == action.incognito_address,
            "porting {id} belongs to another address"
        );
        ensure!(
            porting.amount == action.porting_amount,
            "porting {id} amount is {}",
            porting.amount
        );
        let claim = ProofClaim {
            token_id: porting.token_id.clone(),
            unique_id: id.clone(),
            proof: action.porting_proof.clone(),
            receivers: porting
                .custodians
                .iter()
                .map(|d| (d.remote_address.clone(), d.amount))
                .collect(),
        };
        ensure!(ctx.verifier.verify(&claim)?, "invalid porting proof");

        let porting = checked!(rejectable(state.settle_porting(id)));
        ctx.effects.count_up(&porting.token_id, porting.amount)?;
        Ok(Ok(ActionOutcome::default()))
    }
}

impl PortalInstructionProcessor for RequestPTokenProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::RequestPToken
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: RequestPTokenAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, &action);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Exchange rates
// =============================================================================

/// Rate submission, folded into the final rates at block end.
pub struct ExchangeRatesProcessor;

impl ExchangeRatesProcessor {
    fn apply(
        ctx: &BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        action: &ExchangeRatesAction,
    ) -> Checked<ActionOutcome> {
        ensure!(!action.rates.is_empty(), "no rates submitted");
        for info in &action.rates {
            ensure!(
                info.token_id == PRV_ID || ctx.params.is_rated_asset(&info.token_id),
                "unsupported asset {}",
                info.token_id
            );
            ensure!(info.rate > 0, "zero rate for {}", info.token_id);
        }
        state.add_exchange_rates_request(
            &envelope.tx_req_id,
            ExchangeRatesRequest {
                sender_address: action.sender_address.clone(),
                rates: action.rates.clone(),
            },
        );
        Ok(Ok(ActionOutcome::default()))
    }
}

impl PortalInstructionProcessor for ExchangeRatesProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::ExchangeRates
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: ExchangeRatesAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, envelope, &action);
        reply.settle(ctx, checked)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{status_of, Harness, PBTC};
    use super::*;
    use crate::domain::{ExchangeRateInfo, InstructionStatus};

    fn porting_request(id: &str, amount: u64, fee: u64) -> PortingRequestAction {
        PortingRequestAction {
            unique_register_id: id.into(),
            incognito_address: "user".into(),
            token_id: PBTC.into(),
            register_amount: amount,
            porting_fee: fee,
        }
    }

    #[test]
    fn test_porting_request_accepted() {
        let mut h = Harness::new();
        h.custodian("cus1", 100_000);
        let (insts, effects) = h.run(
            InstructionKind::PortingRequest,
            "tx1",
            &porting_request("p1", 100, 1000),
        );
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        let porting = h.state.waiting_porting("p1").unwrap();
        assert_eq!(porting.beacon_height, 11);
        // 150% of 100 pBTC at 50 PRV each
        assert_eq!(porting.custodians[0].locked_amount_collateral, 7500);
        assert_eq!(effects.new_portings[0].unique_porting_id, "p1");
        assert_eq!(effects.statuses[0].id, "p1");
    }

    #[test]
    fn test_porting_request_rejections() {
        let mut h = Harness::new();
        h.custodian("cus1", 100_000);

        // fee floor is 100 PRV units
        let (insts, _) = h.run(
            InstructionKind::PortingRequest,
            "tx1",
            &porting_request("p1", 100, 99),
        );
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);

        let (insts, _) = h.run(
            InstructionKind::PortingRequest,
            "tx2",
            &porting_request("p2", 1_000_000, 1_000_000),
        );
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
        assert!(h.state.waiting_portings().is_empty());

        h.run(
            InstructionKind::PortingRequest,
            "tx3",
            &porting_request("p3", 10, 100),
        );
        let (insts, _) = h.run(
            InstructionKind::PortingRequest,
            "tx4",
            &porting_request("p3", 10, 100),
        );
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);

        h.store.mark_porting_id_used("p4");
        let (insts, _) = h.run(
            InstructionKind::PortingRequest,
            "tx5",
            &porting_request("p4", 10, 100),
        );
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
        assert!(h.state.waiting_porting("p4").is_none());
    }

    #[test]
    fn test_porting_rejected_without_rates() {
        let mut h = Harness::new();
        h.custodian("cus1", 100_000);
        h.state.final_exchange_rates = None;
        let (insts, _) = h.run(
            InstructionKind::PortingRequest,
            "tx1",
            &porting_request("p1", 100, 1000),
        );
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);
    }

    #[test]
    fn test_request_ptoken() {
        let mut h = Harness::new();
        h.custodian("cus1", 100_000);
        h.run(
            InstructionKind::PortingRequest,
            "tx1",
            &porting_request("p1", 100, 1000),
        );
        let mut request = RequestPTokenAction {
            unique_porting_id: "p1".into(),
            token_id: PBTC.into(),
            incognito_address: "user".into(),
            porting_amount: 99,
            porting_proof: "proof".into(),
        };
        let (insts, _) = h.run(InstructionKind::RequestPToken, "tx2", &request);
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);

        request.porting_amount = 100;
        let (insts, effects) = h.run(InstructionKind::RequestPToken, "tx3", &request);
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        assert_eq!(h.state.custodian("cus1").unwrap().holding_of(PBTC), 100);
        assert!(h.state.waiting_porting("p1").is_none());
        assert_eq!(effects.bridge_deltas[PBTC].count_up_amount, 100);
    }

    #[test]
    fn test_exchange_rates_submission() {
        let mut h = Harness::new();
        let bad = ExchangeRatesAction {
            sender_address: "feeder".into(),
            rates: vec![ExchangeRateInfo {
                token_id: PBTC.into(),
                rate: 0,
            }],
        };
        let (insts, _) = h.run(InstructionKind::ExchangeRates, "tx1", &bad);
        assert_eq!(status_of(&insts), InstructionStatus::Rejected);

        let good = ExchangeRatesAction {
            sender_address: "feeder".into(),
            rates: vec![ExchangeRateInfo {
                token_id: PBTC.into(),
                rate: 60_000_000,
            }],
        };
        let (insts, _) = h.run(InstructionKind::ExchangeRates, "tx2", &good);
        assert_eq!(status_of(&insts), InstructionStatus::Accepted);
        assert!(h.state.exchange_rates_requests().contains_key("tx2"));
        // rates change only when the block's submissions are folded in
        assert_eq!(h.state.final_exchange_rates().unwrap().rates[PBTC], 50_000_000);
        h.state.apply_exchange_rates_requests();
        assert_eq!(h.state.final_exchange_rates().unwrap().rates[PBTC], 60_000_000);
    }
}
