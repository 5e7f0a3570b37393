//! # Redeem Match Engine
//!
//! Protocol-driven custodian selection for redeems, and the checks behind a
//! custodian volunteering for a waiting redeem.

use crate::domain::{
    Amount, CustodianState, MatchingRedeemCustodianDetail, PortalError, RedeemRequest,
};
use std::collections::BTreeMap;

/// Pick custodians holding `token_id` to cover `amount`.
///
/// Holders are sorted ascending by holding (ties by address ascending) and
/// consumed from the largest down.
pub fn pick_custodians_for_redeem(
    amount: Amount,
    token_id: &str,
    custodians: &BTreeMap<String, CustodianState>,
) -> Result<Vec<MatchingRedeemCustodianDetail>, PortalError> {
    let mut holders: Vec<(&CustodianState, Amount)> = custodians
        .values()
        .map(|c| (c, c.holding_of(token_id)))
        .filter(|(_, holding)| *holding > 0)
        .collect();
    holders.sort_by(|(a, a_hold), (b, b_hold)| {
        a_hold
            .cmp(b_hold)
            .then_with(|| a.incognito_address.cmp(&b.incognito_address))
    });

    let mut picks = Vec::new();
    let mut remaining = amount;
    for (custodian, holding) in holders.iter().rev() {
        if remaining == 0 {
            break;
        }
        let remote_address = custodian
            .remote_addresses
            .get(token_id)
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| PortalError::NoRemoteAddress {
                custodian: custodian.incognito_address.clone(),
                token: token_id.to_string(),
            })?;
        let matched = (*holding).min(remaining);
        picks.push(MatchingRedeemCustodianDetail {
            incognito_address: custodian.incognito_address.clone(),
            remote_address: remote_address.clone(),
            amount: matched,
        });
        remaining -= matched;
    }

    if remaining > 0 {
        return Err(PortalError::NotEnoughPublicToken {
            token: token_id.to_string(),
            needed: amount,
            available: amount - remaining,
        });
    }
    Ok(picks)
}

/// How much a volunteering custodian can contribute to a waiting redeem,
/// and whether that completes the match.
pub fn match_custodian_to_waiting_redeem(
    custodian_address: &str,
    redeem_id: &str,
    waiting_redeems: &BTreeMap<String, RedeemRequest>,
    custodians: &BTreeMap<String, CustodianState>,
) -> Result<(Amount, bool), PortalError> {
    let redeem = waiting_redeems
        .get(redeem_id)
        .ok_or_else(|| PortalError::RedeemNotFound(redeem_id.to_string()))?;
    let custodian = custodians
        .get(custodian_address)
        .ok_or_else(|| PortalError::CustodianNotFound(custodian_address.to_string()))?;

    let holding = custodian.holding_of(&redeem.token_id);
    if holding == 0 {
        return Err(PortalError::InsufficientHolding {
            token: redeem.token_id.clone(),
            needed: redeem.unmatched_amount(),
            available: 0,
        });
    }
    if custodian
        .remote_addresses
        .get(&redeem.token_id)
        .map_or(true, |addr| addr.is_empty())
    {
        return Err(PortalError::NoRemoteAddress {
            custodian: custodian_address.to_string(),
            token: redeem.token_id.clone(),
        });
    }

    let needed = redeem.unmatched_amount();
    if needed == 0 {
        return Err(PortalError::ConsistencyViolation(format!(
            "waiting redeem {redeem_id} is already fully matched"
        )));
    }
    Ok((holding.min(needed), holding >= needed))
}
