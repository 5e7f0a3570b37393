//! # Automatic Sweeps
//!
//! Transitions the engine applies on its own each block:
//!
//! - before actions: expired portings, runaway custodians, liquidation by rates
//! - after actions: pick more custodians, rewards
//!
//! Failures that only concern one request are logged and reported with a
//! `failed` instruction. State violations abort the block.

use super::processors::BlockContext;
use super::state::CurrentPortalState;
use crate::algorithms::{
    pick_custodians_for_redeem, split_epoch_reward, split_fee_by_amount,
    split_liquidated_collateral, unlock_amount_usd, ExchangeRateTool, LiquidationSplit,
    LiquidationSplitParams,
};
use crate::domain::{
    Amount, CollateralTier, CustodianState, FinalExchangeRates, InstructionKind,
    InstructionStatus, PortalError, RedeemRequest, PRV_ID,
};
use crate::ipc::{
    CancelledRedeemContent, ExpiredPortingContent, Instruction, LiquidateByRatesContent,
    LiquidateCustodianContent, LiquidationByRatesDetail, PickMoreCustodianContent, RewardContent,
    TotalRewardContent,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Shard ID carried by instructions that no shard requested.
pub const BEACON_SHARD_ID: u8 = 0;

fn emit<T: Serialize>(
    ctx: &mut BlockContext<'_>,
    kind: InstructionKind,
    shard_id: u8,
    status: InstructionStatus,
    status_id: &str,
    content: &T,
) -> Result<Instruction, PortalError> {
    let inst = Instruction::new(kind, shard_id, status, content)?;
    ctx.effects.record_status(&inst, status_id);
    Ok(inst)
}

/// Pass through state violations, log anything else and return `None`.
fn tolerate<T>(
    ctx: &BlockContext<'_>,
    what: &str,
    result: Result<T, PortalError>,
) -> Result<Option<T>, PortalError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_state_violation() => Err(e),
        Err(e) => {
            ctx.logger
                .errorf(format_args!("[qc-15] {what} skipped: {e}"));
            Ok(None)
        }
    }
}

fn rates_or_log(
    ctx: &BlockContext<'_>,
    state: &CurrentPortalState,
    what: &str,
) -> Option<FinalExchangeRates> {
    match state.current_rates() {
        Ok(rates) => Some(rates),
        Err(e) => {
            ctx.logger.warnf(format_args!("[qc-15] {what} skipped: {e}"));
            None
        }
    }
}

// =============================================================================
// Expired portings
// =============================================================================

/// Release the collateral of waiting portings past their deadline.
pub fn expire_waiting_portings(
    ctx: &mut BlockContext<'_>,
    state: &mut CurrentPortalState,
) -> Result<Vec<Instruction>, PortalError> {
    let timeout = ctx.params.timeout_waiting_porting_request_secs;
    let expired: Vec<String> = state
        .waiting_portings()
        .values()
        .filter(|p| ctx.is_timed_out(p.beacon_height, timeout))
        .map(|p| p.unique_porting_id.clone())
        .collect();

    let mut insts = Vec::new();
    for id in expired {
        let Some(porting) = tolerate(ctx, "porting expiry", state.expire_porting(&id))? else {
            continue;
        };
        ctx.logger
            .infof(format_args!("[qc-15] porting {id} expired"));
        let content = ExpiredPortingContent {
            unique_porting_id: porting.unique_porting_id,
            token_id: porting.token_id,
            porter_address: porting.porter_address,
            amount: porting.amount,
            custodians: porting.custodians,
            porting_fee: porting.porting_fee,
        };
        insts.push(emit(
            ctx,
            InstructionKind::ExpiredWaitingPorting,
            porting.shard_id,
            InstructionStatus::Success,
            &id,
            &content,
        )?);
    }
    Ok(insts)
}

// =============================================================================
// Runaway custodians
// =============================================================================

fn runaway_split(
    ctx: &BlockContext<'_>,
    state: &CurrentPortalState,
    tool: &ExchangeRateTool<'_>,
    redeem: &RedeemRequest,
    custodian: &str,
) -> Result<(Amount, LiquidationSplit), PortalError> {
    let share = redeem.share_of(custodian);
    let (unlock_usd, position) = state.unlock_usd_for(tool, custodian, &redeem.token_id, share)?;
    let split = split_liquidated_collateral(
        tool,
        &LiquidationSplitParams {
            ptoken: &redeem.token_id,
            liquidated_pub_amount: share,
            available: &position.available,
            total_unlock_usd: unlock_usd,
            max_percent_liquidated: ctx.params.max_percent_liquidated_collateral_amount,
        },
    )?;
    Ok((share, split))
}

/// Seize the collateral of custodians that did not return public tokens
/// for a matched redeem in time. The seized part goes to the redeemer.
pub fn liquidate_runaway_custodians(
    ctx: &mut BlockContext<'_>,
    state: &mut CurrentPortalState,
) -> Result<Vec<Instruction>, PortalError> {
    let timeout = ctx.params.timeout_custodian_return_pub_token_secs;
    let overdue: Vec<RedeemRequest> = state
        .matched_redeems()
        .values()
        .filter(|r| ctx.is_timed_out(r.beacon_height, timeout))
        .cloned()
        .collect();
    if overdue.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rates) = rates_or_log(ctx, state, "runaway liquidation") else {
        return Ok(Vec::new());
    };
    let tool = ExchangeRateTool::new(&rates, ctx.params);

    let mut insts = Vec::new();
    for redeem in overdue {
        for detail in &redeem.custodians {
            let custodian = &detail.incognito_address;
            let status_id = format!("{}:{custodian}", redeem.unique_redeem_id);
            let mut content = LiquidateCustodianContent {
                unique_redeem_id: redeem.unique_redeem_id.clone(),
                token_id: redeem.token_id.clone(),
                redeemer_address: redeem.redeemer_address.clone(),
                redeemer_external_address: redeem.redeemer_external_address.clone(),
                custodian_address: custodian.clone(),
                liquidated_pub_token_amount: detail.amount,
                liquidated_collaterals: BTreeMap::new(),
                remain_unlock_collaterals: BTreeMap::new(),
            };

            let seized = runaway_split(ctx, state, &tool, &redeem, custodian).and_then(
                |(share, split)| {
                    state.seize_split(custodian, &redeem.token_id, &split)?;
                    state.remove_matched_custodian(&redeem.unique_redeem_id, custodian)?;
                    Ok((share, split))
                },
            );
            let status = match tolerate(ctx, "runaway liquidation", seized)? {
                Some((share, split)) => {
                    ctx.logger.infof(format_args!(
                        "[qc-15] custodian {custodian} liquidated for redeem {}",
                        redeem.unique_redeem_id
                    ));
                    content.liquidated_pub_token_amount = share;
                    content.liquidated_collaterals = split.liquidated;
                    content.remain_unlock_collaterals = split.remain;
                    InstructionStatus::Success
                }
                None => InstructionStatus::Failed,
            };
            insts.push(emit(
                ctx,
                InstructionKind::LiquidateCustodian,
                redeem.shard_id,
                status,
                &status_id,
                &content,
            )?);
        }
    }
    Ok(insts)
}

// =============================================================================
// Liquidation by rates
// =============================================================================

fn cancel_redeem(
    ctx: &mut BlockContext<'_>,
    state: &mut CurrentPortalState,
    redeem_id: &str,
    reason: &str,
) -> Result<Option<Instruction>, PortalError> {
    let Some(redeem) = tolerate(ctx, "redeem cancel", state.cancel_waiting_redeem(redeem_id))?
    else {
        return Ok(None);
    };
    ctx.effects.count_up(&redeem.token_id, redeem.redeem_amount)?;
    ctx.logger
        .warnf(format_args!("[qc-15] redeem {redeem_id} cancelled: {reason}"));
    let shard_id = redeem.shard_id;
    let content = CancelledRedeemContent {
        redeem,
        reason: reason.to_string(),
    };
    emit(
        ctx,
        InstructionKind::LiquidationCancelledRedeem,
        shard_id,
        InstructionStatus::Rejected,
        redeem_id,
        &content,
    )
    .map(Some)
}

/// Liquidate one under-collateralized position. The work happens on a draft
/// so a failure leaves `state` untouched.
fn liquidate_position(
    ctx: &mut BlockContext<'_>,
    state: &mut CurrentPortalState,
    tool: &ExchangeRateTool<'_>,
    custodian: &str,
    ptoken: &str,
    ratio: u128,
    insts: &mut Vec<Instruction>,
) -> Result<Option<LiquidationByRatesDetail>, PortalError> {
    let mut draft = state.clone();
    let position = draft.position(tool, custodian, ptoken)?;
    let liquidated = position.total_holding() - position.matched_share;
    if liquidated == 0 {
        return Ok(None);
    }
    let unlock_usd = unlock_amount_usd(liquidated, position.locked_usd, position.total_holding())?;
    let split = split_liquidated_collateral(
        tool,
        &LiquidationSplitParams {
            ptoken,
            liquidated_pub_amount: liquidated,
            available: &position.available,
            total_unlock_usd: unlock_usd,
            max_percent_liquidated: ctx.params.max_percent_liquidated_collateral_amount,
        },
    )?;

    let pending: Vec<String> = draft
        .waiting_redeems()
        .values()
        .filter(|r| r.token_id == ptoken && r.share_of(custodian) > 0)
        .map(|r| r.unique_redeem_id.clone())
        .collect();
    let mut cancelled = Vec::new();
    let mut draft_ctx_effects = ctx.effects.clone();
    for redeem_id in &pending {
        let redeem = draft.cancel_waiting_redeem(redeem_id)?;
        draft_ctx_effects.count_up(&redeem.token_id, redeem.redeem_amount)?;
        cancelled.push(redeem);
    }
    draft.liquidate_into_pool(custodian, ptoken, liquidated, &split)?;

    *state = draft;
    ctx.effects = draft_ctx_effects;
    for redeem in cancelled {
        let redeem_id = redeem.unique_redeem_id.clone();
        let shard_id = redeem.shard_id;
        ctx.logger.warnf(format_args!(
            "[qc-15] redeem {redeem_id} cancelled: custodian {custodian} liquidated"
        ));
        let content = CancelledRedeemContent {
            redeem,
            reason: format!("custodian {custodian} liquidated"),
        };
        insts.push(emit(
            ctx,
            InstructionKind::LiquidationCancelledRedeem,
            shard_id,
            InstructionStatus::Rejected,
            &redeem_id,
            &content,
        )?);
    }
    Ok(Some(LiquidationByRatesDetail {
        ratio,
        liquidated_pub_token_amount: liquidated,
        liquidated_collaterals: split.liquidated,
        remain_unlock_collaterals: split.remain,
    }))
}

/// Classify every custodian position against the ratio thresholds,
/// liquidate those at or below TP120 and record the warning tier.
pub fn liquidate_by_rates(
    ctx: &mut BlockContext<'_>,
    state: &mut CurrentPortalState,
) -> Result<Vec<Instruction>, PortalError> {
    let Some(rates) = rates_or_log(ctx, state, "liquidation by rates") else {
        return Ok(Vec::new());
    };
    let tool = ExchangeRateTool::new(&rates, ctx.params);
    let params = ctx.params;

    let mut insts = Vec::new();
    let mut warnings: BTreeMap<String, BTreeMap<String, u128>> = BTreeMap::new();
    let addresses: Vec<String> = state.custodians().keys().cloned().collect();
    for address in addresses {
        let mut details = BTreeMap::new();
        for ptoken in params.portal_tokens.keys() {
            let Some(position) =
                tolerate(ctx, "ratio check", state.position(&tool, &address, ptoken))?
            else {
                continue;
            };
            let Some(ratio) =
                tolerate(ctx, "ratio check", state.position_ratio(&tool, &position, ptoken))?
                    .flatten()
            else {
                continue;
            };
            match CollateralTier::classify(ratio, params.tp120, params.tp130) {
                CollateralTier::Healthy => {}
                CollateralTier::Warning => {
                    warnings
                        .entry(address.clone())
                        .or_default()
                        .insert(ptoken.clone(), ratio);
                }
                CollateralTier::Liquidate => {
                    let liquidated = liquidate_position(
                        ctx, state, &tool, &address, ptoken, ratio, &mut insts,
                    );
                    if let Some(Some(detail)) = tolerate(ctx, "liquidation by rates", liquidated)? {
                        ctx.logger.infof(format_args!(
                            "[qc-15] custodian {address} liquidated for {ptoken} at ratio {ratio}"
                        ));
                        details.insert(ptoken.clone(), detail);
                    }
                }
            }
        }
        if !details.is_empty() {
            let content = LiquidateByRatesContent {
                custodian_address: address.clone(),
                details,
            };
            insts.push(emit(
                ctx,
                InstructionKind::LiquidateByRates,
                BEACON_SHARD_ID,
                InstructionStatus::Accepted,
                &address,
                &content,
            )?);
        }
    }
    state.set_ratio_warnings(warnings);
    Ok(insts)
}

// =============================================================================
// Pick more custodians
// =============================================================================

fn pick_remaining(
    state: &mut CurrentPortalState,
    redeem: &RedeemRequest,
) -> Result<PickMoreCustodianContent, PortalError> {
    let candidates: BTreeMap<String, CustodianState> = state
        .custodians()
        .iter()
        .filter(|(address, _)| redeem.share_of(address) == 0)
        .map(|(address, custodian)| (address.clone(), custodian.clone()))
        .collect();
    let picks =
        pick_custodians_for_redeem(redeem.unmatched_amount(), &redeem.token_id, &candidates)?;
    state.assign_redeem_custodians(&redeem.unique_redeem_id, &picks)?;
    Ok(PickMoreCustodianContent {
        unique_redeem_id: redeem.unique_redeem_id.clone(),
        token_id: redeem.token_id.clone(),
        custodians: picks,
    })
}

/// Complete waiting redeems that custodians did not fill in time, or cancel
/// them when the pool cannot.
pub fn pick_more_custodians(
    ctx: &mut BlockContext<'_>,
    state: &mut CurrentPortalState,
) -> Result<Vec<Instruction>, PortalError> {
    let timeout = ctx.params.timeout_waiting_redeem_request_secs;
    let overdue: Vec<RedeemRequest> = state
        .waiting_redeems()
        .values()
        .filter(|r| ctx.is_timed_out(r.beacon_height, timeout))
        .cloned()
        .collect();

    let mut insts = Vec::new();
    for redeem in overdue {
        let id = &redeem.unique_redeem_id;
        match tolerate(ctx, "pick more custodians", pick_remaining(state, &redeem))? {
            Some(content) => {
                ctx.logger
                    .infof(format_args!("[qc-15] redeem {id} matched by the protocol"));
                if let Some(matched) = state.matched_redeem(id) {
                    ctx.effects.newly_matched_redeems.push(matched.clone());
                }
                insts.push(emit(
                    ctx,
                    InstructionKind::PickMoreCustodianForRedeem,
                    redeem.shard_id,
                    InstructionStatus::Success,
                    id,
                    &content,
                )?);
            }
            None => {
                let content = PickMoreCustodianContent {
                    unique_redeem_id: id.clone(),
                    token_id: redeem.token_id.clone(),
                    custodians: Vec::new(),
                };
                insts.push(emit(
                    ctx,
                    InstructionKind::PickMoreCustodianForRedeem,
                    redeem.shard_id,
                    InstructionStatus::Failed,
                    id,
                    &content,
                )?);
                insts.extend(cancel_redeem(ctx, state, id, "not enough custodians")?);
            }
        }
    }
    Ok(insts)
}

// =============================================================================
// Rewards
// =============================================================================

fn reward_add(value: Amount, amount: Amount) -> Result<Amount, PortalError> {
    value
        .checked_add(amount)
        .ok_or(PortalError::ArithmeticOverflow("reward sum"))
}

fn add_shares(
    rewards: &mut BTreeMap<String, BTreeMap<String, Amount>>,
    token: &str,
    shares: Vec<(String, Amount)>,
) -> Result<(), PortalError> {
    for (custodian, amount) in shares {
        if amount == 0 {
            continue;
        }
        let entry = rewards
            .entry(custodian)
            .or_default()
            .entry(token.to_string())
            .or_insert(0);
        *entry = reward_add(*entry, amount)?;
    }
    Ok(())
}

/// Split this block's porting and redeem fees across the matched
/// custodians, snapshot locked collateral, and pay the epoch reward at
/// epoch boundaries.
pub fn distribute_rewards(
    ctx: &mut BlockContext<'_>,
    state: &mut CurrentPortalState,
) -> Result<Vec<Instruction>, PortalError> {
    let mut rewards: BTreeMap<String, BTreeMap<String, Amount>> = BTreeMap::new();

    for porting in &ctx.effects.new_portings {
        let parts: Vec<(String, Amount)> = porting
            .custodians
            .iter()
            .map(|d| (d.incognito_address.clone(), d.amount))
            .collect();
        add_shares(&mut rewards, PRV_ID, split_fee_by_amount(porting.porting_fee, &parts)?)?;
    }
    for redeem in &ctx.effects.newly_matched_redeems {
        let parts: Vec<(String, Amount)> = redeem
            .custodians
            .iter()
            .map(|d| (d.incognito_address.clone(), d.amount))
            .collect();
        add_shares(&mut rewards, PRV_ID, split_fee_by_amount(redeem.redeem_fee, &parts)?)?;
    }

    if let Ok(rates) = state.current_rates() {
        let tool = ExchangeRateTool::new(&rates, ctx.params);
        state.accumulate_locked_collateral(&tool)?;
    }

    let params = ctx.params;
    if params.epoch_length > 0 && ctx.beacon_height % params.epoch_length == 0 {
        let locked = state.reset_locked_collateral();
        if params.reward_per_epoch > 0 {
            let epoch = BTreeMap::from([(PRV_ID.to_string(), params.reward_per_epoch)]);
            for (custodian, tokens) in split_epoch_reward(&epoch, &locked)? {
                for (token, amount) in tokens {
                    add_shares(&mut rewards, &token, vec![(custodian.clone(), amount)])?;
                }
            }
        }
    }

    let mut paid: BTreeMap<String, BTreeMap<String, Amount>> = BTreeMap::new();
    for (custodian, tokens) in rewards {
        for (token, amount) in tokens {
            if tolerate(ctx, "reward", state.add_reward(&custodian, &token, amount))?.is_some() {
                paid.entry(custodian.clone()).or_default().insert(token, amount);
            }
        }
    }
    if paid.is_empty() {
        return Ok(Vec::new());
    }

    let mut totals: BTreeMap<String, Amount> = BTreeMap::new();
    for amount_by_token in paid.values() {
        for (token, amount) in amount_by_token {
            let total = totals.entry(token.clone()).or_insert(0);
            *total = reward_add(*total, *amount)?;
        }
    }
    let status_id = ctx.beacon_height.to_string();
    let beacon_height = ctx.beacon_height;
    Ok(vec![
        emit(
            ctx,
            InstructionKind::Reward,
            BEACON_SHARD_ID,
            InstructionStatus::Accepted,
            &status_id,
            &RewardContent {
                beacon_height,
                rewards: paid,
            },
        )?,
        emit(
            ctx,
            InstructionKind::TotalCustodianReward,
            BEACON_SHARD_ID,
            InstructionStatus::Accepted,
            &status_id,
            &TotalRewardContent {
                beacon_height,
                rewards: totals,
            },
        )?,
    ])
}
