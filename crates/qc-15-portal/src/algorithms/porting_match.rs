//! # Porting Match Engine
//!
//! Picks the custodians that back a porting request and plans how much
//! collateral each one locks.

use super::exchange_rate::{mul_div, to_amount, up_percent, ExchangeRateTool};
use super::ledger::{collateral_walk_order, drain_by_usd};
use crate::domain::{
    Amount, CustodianState, MatchingPortingCustodianDetail, PortalError, UsdAmount, PRV_ID,
};
use std::collections::BTreeMap;

/// Parameters for picking porting custodians.
pub struct PortingPickParams<'a> {
    /// Portal token being ported.
    pub token_id: &'a str,
    /// Requested pToken amount.
    pub amount: Amount,
    /// Custodian pool.
    pub custodians: &'a BTreeMap<String, CustodianState>,
    /// Converter over the current rates.
    pub tool: &'a ExchangeRateTool<'a>,
    /// Over-collateralization percent.
    pub min_percent_locked_collateral: u64,
}

/// Free collateral of a custodian, PRV keyed by [`PRV_ID`].
fn free_assets(custodian: &CustodianState) -> BTreeMap<String, Amount> {
    let mut assets = custodian.free_token_collaterals.clone();
    assets.insert(PRV_ID.to_string(), custodian.free_collateral);
    assets
}

/// Custodians with a remote address for the token, sorted by free USD value
/// descending with ties broken by address ascending.
pub fn rank_custodians_for_porting<'c>(
    token_id: &str,
    custodians: &'c BTreeMap<String, CustodianState>,
    tool: &ExchangeRateTool<'_>,
) -> Result<Vec<(&'c CustodianState, UsdAmount)>, PortalError> {
    let mut ranked = Vec::new();
    for custodian in custodians.values() {
        let has_remote = custodian
            .remote_addresses
            .get(token_id)
            .is_some_and(|addr| !addr.is_empty());
        if !has_remote {
            continue;
        }
        let free_usd = tool.total_usd(&free_assets(custodian))?;
        ranked.push((custodian, free_usd));
    }
    ranked.sort_by(|(a, a_usd), (b, b_usd)| {
        b_usd
            .cmp(a_usd)
            .then_with(|| a.incognito_address.cmp(&b.incognito_address))
    });
    Ok(ranked)
}

/// Pick custodians for a porting request.
///
/// The richest custodian is used alone when it covers the target value;
/// otherwise the ranked list is walked until the target is met. Each pick
/// gets a pToken share proportional to the USD it covers, and its lock is
/// drawn from free PRV first, then token collateral in ID order.
pub fn pick_custodians_for_porting(
    params: &PortingPickParams<'_>,
) -> Result<Vec<MatchingPortingCustodianDetail>, PortalError> {
    if params.custodians.is_empty() {
        return Err(PortalError::CustodianPoolEmpty);
    }
    let tool = params.tool;
    let ranked = rank_custodians_for_porting(params.token_id, params.custodians, tool)?;
    if ranked.is_empty() {
        return Err(PortalError::CustodianPoolEmpty);
    }

    let target_amount = up_percent(params.amount, params.min_percent_locked_collateral)?;
    let target_usd = tool.to_usd(params.token_id, target_amount)?;
    if target_usd == 0 {
        return Err(PortalError::ZeroUnlockAmount);
    }

    let mut picks: Vec<(&CustodianState, UsdAmount)> = Vec::new();
    if ranked[0].1 >= target_usd {
        picks.push((ranked[0].0, target_usd));
    } else {
        let mut remaining = target_usd;
        for (custodian, free_usd) in &ranked {
            if remaining == 0 {
                break;
            }
            if *free_usd == 0 {
                continue;
            }
            let matched = (*free_usd).min(remaining);
            picks.push((custodian, matched));
            remaining -= matched;
        }
        if remaining > 0 {
            return Err(PortalError::NotEnoughCustodians {
                target_usd,
                available_usd: target_usd - remaining,
            });
        }
    }

    let mut details = Vec::with_capacity(picks.len());
    let mut allotted: Amount = 0;
    for (custodian, matched_usd) in picks {
        let share = to_amount(mul_div(
            matched_usd,
            params.amount as u128,
            target_usd,
        )?)?;
        allotted = allotted
            .checked_add(share)
            .ok_or(PortalError::ArithmeticOverflow("porting allotment"))?;

        let free = free_assets(custodian);
        let drain = drain_by_usd(tool, &collateral_walk_order(&free), matched_usd)?;
        if drain.usd_left > 0 {
            return Err(PortalError::CollateralExhausted {
                usd_left: drain.usd_left,
            });
        }
        let mut locked_token_collaterals = drain.taken;
        let locked_amount_collateral = locked_token_collaterals.remove(PRV_ID).unwrap_or(0);

        details.push(MatchingPortingCustodianDetail {
            incognito_address: custodian.incognito_address.clone(),
            remote_address: custodian
                .remote_addresses
                .get(params.token_id)
                .cloned()
                .unwrap_or_default(),
            amount: share,
            locked_amount_collateral,
            locked_token_collaterals,
        });
    }

    let shortfall = params
        .amount
        .checked_sub(allotted)
        .ok_or_else(|| PortalError::ConsistencyViolation("porting over-allotted".into()))?;
    if let Some(first) = details.first_mut() {
        first.amount += shortfall;
    }
    Ok(details)
}
