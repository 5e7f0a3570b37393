//! Custodian collateral actions.

use super::{
    checked, ensure, rejectable, AuxData, BlockContext, Checked, PortalInstructionProcessor,
    Rejection, Reply,
};
use crate::application::state::CurrentPortalState;
use crate::domain::{Amount, InstructionKind, PortalError, PRV_ID};
use crate::ipc::{
    ActionEnvelope, ActionOutcome, CustodianDepositAction, CustodianTopupAction,
    CustodianWithdrawAction, Instruction, TopupWaitingPortingAction, UnlockOverRateAction,
    WithdrawRewardAction,
};
use crate::ports::outbound::{PortalStateStore, ProofClaim};

/// Token collateral arrives through an external transaction that must be
/// unspent and proven. PRV arrives with the action itself.
fn check_external_deposit(
    ctx: &BlockContext<'_>,
    aux: &AuxData,
    asset: &str,
    amount: Amount,
    receiver: &str,
    external_tx_id: &str,
    proof: &str,
) -> Checked<()> {
    if asset == PRV_ID || amount == 0 {
        return Ok(Ok(()));
    }
    ensure!(!external_tx_id.is_empty(), "missing external tx id");
    ensure!(
        !ctx.effects.is_external_tx_spent(aux, external_tx_id),
        "external tx {external_tx_id} already used"
    );
    let claim = ProofClaim {
        token_id: asset.to_string(),
        unique_id: receiver.to_string(),
        proof: proof.to_string(),
        receivers: vec![(receiver.to_string(), amount)],
    };
    ensure!(ctx.verifier.verify(&claim)?, "invalid deposit proof");
    Ok(Ok(()))
}

fn external_tx_aux(
    store: &dyn PortalStateStore,
    external_tx_id: &str,
) -> Result<AuxData, PortalError> {
    Ok(AuxData {
        external_tx_used: !external_tx_id.is_empty() && store.is_external_tx_used(external_tx_id)?,
        ..Default::default()
    })
}

// =============================================================================
// Deposit
// =============================================================================

/// Custodian deposits collateral.
pub struct CustodianDepositProcessor;

impl CustodianDepositProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        action: &CustodianDepositAction,
        aux: &AuxData,
    ) -> Checked<ActionOutcome> {
        let params = ctx.params;
        ensure!(action.deposit_amount > 0, "deposit amount is zero");
        ensure!(
            params.is_supported_collateral(&action.collateral_token_id),
            "unsupported collateral {}",
            action.collateral_token_id
        );
        for token in action.remote_addresses.keys() {
            ensure!(params.is_portal_token(token), "unknown portal token {token}");
        }
        ensure!(
            state.custodian(&action.incognito_address).is_some()
                || !action.remote_addresses.is_empty(),
            "new custodian without remote addresses"
        );
        checked!(check_external_deposit(
            ctx,
            aux,
            &action.collateral_token_id,
            action.deposit_amount,
            &action.incognito_address,
            &action.external_tx_id,
            &action.proof,
        ));

        checked!(rejectable(state.deposit_collateral(
            &action.incognito_address,
            &action.collateral_token_id,
            action.deposit_amount,
            &action.remote_addresses,
        )));
        if action.collateral_token_id != PRV_ID {
            ctx.effects
                .used_external_tx_ids
                .insert(action.external_tx_id.clone());
        }
        Ok(Ok(ActionOutcome::default()))
    }
}

impl PortalInstructionProcessor for CustodianDepositProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::CustodianDeposit
    }

    fn prepare_data_before_processing(
        &self,
        store: &dyn PortalStateStore,
        envelope: &ActionEnvelope,
    ) -> Result<AuxData, PortalError> {
        let action: CustodianDepositAction = envelope.meta_as()?;
        external_tx_aux(store, &action.external_tx_id)
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: CustodianDepositAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, &action, aux);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Withdraw
// =============================================================================

/// Custodian withdraws free collateral.
pub struct CustodianWithdrawProcessor;

impl CustodianWithdrawProcessor {
    fn apply(state: &mut CurrentPortalState, action: &CustodianWithdrawAction) -> Checked<ActionOutcome> {
        ensure!(action.amount > 0, "withdraw amount is zero");
        let Some(custodian) = state.custodian(&action.incognito_address) else {
            return Ok(Err(Rejection::new(format!(
                "custodian {} not found",
                action.incognito_address
            ))));
        };
        let free = custodian.free_of(&action.collateral_token_id);
        ensure!(free > 0, "no free {} collateral", action.collateral_token_id);
        ensure!(
            action.amount <= free,
            "withdraw {} exceeds free {}",
            action.amount,
            free
        );
        checked!(rejectable(state.withdraw_collateral(
            &action.incognito_address,
            &action.collateral_token_id,
            action.amount,
        )));
        Ok(Ok(ActionOutcome::default()))
    }
}

impl PortalInstructionProcessor for CustodianWithdrawProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::CustodianWithdraw
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: CustodianWithdrawAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(state, &action);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Top-up
// =============================================================================

/// Checks shared by both top-up kinds.
fn check_topup(
    ctx: &BlockContext<'_>,
    state: &CurrentPortalState,
    action: &CustodianTopupAction,
    aux: &AuxData,
) -> Checked<()> {
    let params = ctx.params;
    ensure!(
        params.is_portal_token(&action.ptoken_id),
        "unknown portal token {}",
        action.ptoken_id
    );
    ensure!(
        params.is_supported_collateral(&action.collateral_token_id),
        "unsupported collateral {}",
        action.collateral_token_id
    );
    ensure!(
        action.deposit_amount > 0 || action.free_collateral_amount > 0,
        "top-up amount is zero"
    );
    let Some(custodian) = state.custodian(&action.incognito_address) else {
        return Ok(Err(Rejection::new(format!(
            "custodian {} not found",
            action.incognito_address
        ))));
    };
    let free = custodian.free_of(&action.collateral_token_id);
    ensure!(
        action.free_collateral_amount <= free,
        "free collateral {} exceeds available {}",
        action.free_collateral_amount,
        free
    );
    checked!(check_external_deposit(
        ctx,
        aux,
        &action.collateral_token_id,
        action.deposit_amount,
        &action.incognito_address,
        &action.external_tx_id,
        &action.proof,
    ));
    Ok(Ok(()))
}

/// Custodian tops up collateral for a portal token.
pub struct CustodianTopupProcessor;

impl CustodianTopupProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        action: &CustodianTopupAction,
        aux: &AuxData,
    ) -> Checked<ActionOutcome> {
        checked!(check_topup(ctx, state, action, aux));
        let (waiting_share, matched_share) =
            state.redeem_shares(&action.incognito_address, &action.ptoken_id);
        let holding = state
            .custodian(&action.incognito_address)
            .map(|c| c.holding_of(&action.ptoken_id))
            .unwrap_or(0);
        ensure!(
            holding + waiting_share + matched_share > 0,
            "custodian holds no {}",
            action.ptoken_id
        );

        let added = checked!(rejectable(state.topup_custodian(
            &action.incognito_address,
            &action.ptoken_id,
            &action.collateral_token_id,
            action.deposit_amount,
            action.free_collateral_amount,
        )));
        if action.collateral_token_id != PRV_ID && action.deposit_amount > 0 {
            ctx.effects
                .used_external_tx_ids
                .insert(action.external_tx_id.clone());
        }
        Ok(Ok(ActionOutcome {
            topup_amount: Some(added),
            ..Default::default()
        }))
    }
}

impl PortalInstructionProcessor for CustodianTopupProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::CustodianTopup
    }

    fn prepare_data_before_processing(
        &self,
        store: &dyn PortalStateStore,
        envelope: &ActionEnvelope,
    ) -> Result<AuxData, PortalError> {
        let action: CustodianTopupAction = envelope.meta_as()?;
        external_tx_aux(store, &action.external_tx_id)
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: CustodianTopupAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, &action, aux);
        reply.settle(ctx, checked)
    }
}

/// Custodian tops up its lock for one waiting porting.
pub struct TopupWaitingPortingProcessor;

impl TopupWaitingPortingProcessor {
    fn apply(
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        action: &TopupWaitingPortingAction,
        aux: &AuxData,
    ) -> Checked<ActionOutcome> {
        let topup = &action.topup;
        checked!(check_topup(ctx, state, topup, aux));
        let Some(porting) = state.waiting_porting(&action.porting_id) else {
            return Ok(Err(Rejection::new(format!(
                "waiting porting {} not found",
                action.porting_id
            ))));
        };
        ensure!(
            porting.token_id == topup.ptoken_id,
            "porting {} is for {}",
            action.porting_id,
            porting.token_id
        );
        ensure!(
            porting
                .custodians
                .iter()
                .any(|d| d.incognito_address == topup.incognito_address),
            "custodian {} not matched to porting {}",
            topup.incognito_address,
            action.porting_id
        );

        let added = checked!(rejectable(state.topup_waiting_porting(
            &action.porting_id,
            &topup.incognito_address,
            &topup.collateral_token_id,
            topup.deposit_amount,
            topup.free_collateral_amount,
        )));
        if topup.collateral_token_id != PRV_ID && topup.deposit_amount > 0 {
            ctx.effects
                .used_external_tx_ids
                .insert(topup.external_tx_id.clone());
        }
        Ok(Ok(ActionOutcome {
            topup_amount: Some(added),
            ..Default::default()
        }))
    }
}

impl PortalInstructionProcessor for TopupWaitingPortingProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::TopupWaitingPorting
    }

    fn prepare_data_before_processing(
        &self,
        store: &dyn PortalStateStore,
        envelope: &ActionEnvelope,
    ) -> Result<AuxData, PortalError> {
        let action: TopupWaitingPortingAction = envelope.meta_as()?;
        external_tx_aux(store, &action.topup.external_tx_id)
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: TopupWaitingPortingAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = Self::apply(ctx, state, &action, aux);
        reply.settle(ctx, checked)
    }
}

// =============================================================================
// Over-rate unlock and rewards
// =============================================================================

/// Custodian releases collateral above the over-rate threshold.
pub struct UnlockOverRateProcessor;

impl PortalInstructionProcessor for UnlockOverRateProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::UnlockOverRateCollaterals
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: UnlockOverRateAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let params = ctx.params;
        let checked = if !params.is_portal_token(&action.token_id) {
            Ok(Err(Rejection::new(format!(
                "unknown portal token {}",
                action.token_id
            ))))
        } else {
            rejectable(state.unlock_over_rate(params, &action.custodian_address, &action.token_id))
                .map(|r| {
                    r.map(|released| ActionOutcome {
                        released_collaterals: released,
                        ..Default::default()
                    })
                })
        };
        reply.settle(ctx, checked)
    }
}

/// Custodian withdraws accumulated rewards.
pub struct WithdrawRewardProcessor;

impl PortalInstructionProcessor for WithdrawRewardProcessor {
    fn kind(&self) -> InstructionKind {
        InstructionKind::RequestWithdrawReward
    }

    fn build_new_insts(
        &self,
        ctx: &mut BlockContext<'_>,
        state: &mut CurrentPortalState,
        envelope: &ActionEnvelope,
        shard_id: u8,
        _aux: &AuxData,
    ) -> Result<Vec<Instruction>, PortalError> {
        let action: WithdrawRewardAction = envelope.meta_as()?;
        let reply = Reply::new(self.kind(), shard_id, envelope, &envelope.tx_req_id, &action);
        let checked = rejectable(state.withdraw_reward(&action.custodian_address, &action.token_id))
            .map(|r| {
                r.map(|amount| ActionOutcome {
                    reward_amount: Some(amount),
                    ..Default::default()
                })
            });
        reply.settle(ctx, checked)
    }
}
