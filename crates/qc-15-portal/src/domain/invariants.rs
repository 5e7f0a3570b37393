//! # Domain Invariants
//!
//! Bookkeeping rules checked after state changes.

use super::entities::{CustodianState, RedeemRequest, WaitingPortingRequest};
use super::errors::PortalError;

/// Invariant: collateral conservation.
///
/// `free + Σ locked == total` for PRV and for every token collateral.
pub fn invariant_collateral_conserved(custodian: &CustodianState) -> Result<(), PortalError> {
    let locked_prv: u128 = custodian
        .locked_collaterals
        .values()
        .map(|v| *v as u128)
        .sum();
    if custodian.free_collateral as u128 + locked_prv != custodian.total_collateral as u128 {
        return Err(PortalError::ConsistencyViolation(format!(
            "custodian {} PRV free {} + locked {} != total {}",
            custodian.incognito_address,
            custodian.free_collateral,
            locked_prv,
            custodian.total_collateral
        )));
    }

    for (asset, total) in &custodian.total_token_collaterals {
        let free = custodian.free_token_collaterals.get(asset).copied().unwrap_or(0) as u128;
        let locked: u128 = custodian
            .locked_token_collaterals
            .values()
            .filter_map(|m| m.get(asset))
            .map(|v| *v as u128)
            .sum();
        if free + locked != *total as u128 {
            return Err(PortalError::ConsistencyViolation(format!(
                "custodian {} {} free {} + locked {} != total {}",
                custodian.incognito_address, asset, free, locked, total
            )));
        }
    }
    Ok(())
}

/// Invariant: porting allocation completeness.
///
/// Custodian allotments sum to the requested amount.
pub fn invariant_porting_allocation_complete(request: &WaitingPortingRequest) -> bool {
    let allotted: u128 = request.custodians.iter().map(|c| c.amount as u128).sum();
    allotted == request.amount as u128
}

/// Invariant: redeem matching bound.
///
/// Matched amounts never exceed the requested amount.
pub fn invariant_redeem_within_amount(request: &RedeemRequest) -> bool {
    let matched: u128 = request.custodians.iter().map(|c| c.amount as u128).sum();
    matched <= request.redeem_amount as u128
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::MatchingPortingCustodianDetail;

    #[test]
    fn test_conservation_holds() {
        let mut custodian = CustodianState::new("c");
        custodian.total_collateral = 1000;
        custodian.free_collateral = 250;
        custodian.locked_collaterals.insert("pbtc".into(), 750);
        assert!(invariant_collateral_conserved(&custodian).is_ok());
    }

    #[test]
    fn test_conservation_broken_token() {
        let mut custodian = CustodianState::new("c");
        custodian.total_token_collaterals.insert("usdt".into(), 10);
        custodian.free_token_collaterals.insert("usdt".into(), 4);
        let err = invariant_collateral_conserved(&custodian).unwrap_err();
        assert!(err.to_string().contains("usdt"));
    }

    #[test]
    fn test_allocation_complete() {
        let request = WaitingPortingRequest {
            amount: 10,
            custodians: vec![
                MatchingPortingCustodianDetail {
                    amount: 6,
                    ..Default::default()
                },
                MatchingPortingCustodianDetail {
                    amount: 4,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(invariant_porting_allocation_complete(&request));
    }

    #[test]
    fn test_redeem_within_amount() {
        let request = RedeemRequest {
            redeem_amount: 5,
            ..Default::default()
        };
        assert!(invariant_redeem_within_amount(&request));
    }
}
