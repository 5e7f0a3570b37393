//! # Reward Splits
//!
//! Pro-rata distribution of fees and epoch rewards. The last recipient in
//! each split absorbs the integer-division remainder.

use super::exchange_rate::{mul_div, to_amount};
use crate::domain::{Amount, LockedCollateralState, PortalError};
use std::collections::BTreeMap;

/// Split `fee` across recipients in proportion to their amounts.
pub fn split_fee_by_amount(
    fee: Amount,
    parts: &[(String, Amount)],
) -> Result<Vec<(String, Amount)>, PortalError> {
    let total: u128 = parts.iter().map(|(_, amount)| *amount as u128).sum();
    if total == 0 || fee == 0 {
        return Ok(Vec::new());
    }
    let mut shares = Vec::with_capacity(parts.len());
    let mut distributed: Amount = 0;
    for (idx, (recipient, amount)) in parts.iter().enumerate() {
        let share = if idx + 1 == parts.len() {
            fee - distributed
        } else {
            to_amount(mul_div(fee as u128, *amount as u128, total)?)?
        };
        distributed += share;
        shares.push((recipient.clone(), share));
    }
    Ok(shares)
}

/// Split each epoch reward token across custodians by locked collateral
/// value. Returns custodian → token → amount.
pub fn split_epoch_reward(
    reward: &BTreeMap<String, Amount>,
    locked: &LockedCollateralState,
) -> Result<BTreeMap<String, BTreeMap<String, Amount>>, PortalError> {
    let mut result: BTreeMap<String, BTreeMap<String, Amount>> = BTreeMap::new();
    let total = locked.total_locked_collateral_for_rewards;
    if total == 0 {
        return Ok(result);
    }
    let recipients: Vec<(&String, &u128)> = locked
        .locked_collateral_detail
        .iter()
        .filter(|(_, value)| **value > 0)
        .collect();

    for (token, amount) in reward {
        let mut distributed: Amount = 0;
        for (idx, (custodian, value)) in recipients.iter().enumerate() {
            let share = if idx + 1 == recipients.len() {
                amount.checked_sub(distributed).ok_or_else(|| {
                    PortalError::ConsistencyViolation("epoch reward over-distributed".into())
                })?
            } else {
                to_amount(mul_div(*amount as u128, **value, total)?)?
            };
            distributed += share;
            if share > 0 {
                result
                    .entry((*custodian).clone())
                    .or_default()
                    .insert(token.clone(), share);
            }
        }
    }
    Ok(result)
}
