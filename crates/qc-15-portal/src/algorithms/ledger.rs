//! # Custodian Ledger
//!
//! Collateral and holding bookkeeping for a single custodian.
//!
//! Every mutation checks its operands first and returns an error instead of
//! leaving a negative or partially updated balance.

use super::exchange_rate::ExchangeRateTool;
use crate::domain::{
    Amount, CustodianState, MatchingPortingCustodianDetail, PortalError, UsdAmount, PRV_ID,
};
use std::collections::BTreeMap;

/// Result of draining assets by USD value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsdDrain {
    /// Amount taken per asset.
    pub taken: BTreeMap<String, Amount>,
    /// USD value that could not be covered.
    pub usd_left: UsdAmount,
}

/// Order collateral for a walk: PRV first, then tokens by ID.
pub fn collateral_walk_order(amounts: &BTreeMap<String, Amount>) -> Vec<(String, Amount)> {
    let mut order = Vec::with_capacity(amounts.len());
    if let Some(prv) = amounts.get(PRV_ID) {
        order.push((PRV_ID.to_string(), *prv));
    }
    order.extend(
        amounts
            .iter()
            .filter(|(asset, _)| asset.as_str() != PRV_ID)
            .map(|(asset, amount)| (asset.clone(), *amount)),
    );
    order
}

/// Take assets in walk order until `usd` is covered.
///
/// An asset worth no more than what is still needed is taken whole;
/// otherwise the remaining USD is converted back and the walk stops.
pub fn drain_by_usd(
    tool: &ExchangeRateTool<'_>,
    available: &[(String, Amount)],
    usd: UsdAmount,
) -> Result<UsdDrain, PortalError> {
    let mut drain = UsdDrain {
        taken: BTreeMap::new(),
        usd_left: usd,
    };
    for (asset, amount) in available {
        if drain.usd_left == 0 {
            break;
        }
        if *amount == 0 {
            continue;
        }
        let value = tool.to_usd(asset, *amount)?;
        let taken = if drain.usd_left >= value {
            drain.usd_left -= value;
            *amount
        } else {
            let partial = tool.from_usd(asset, drain.usd_left)?.min(*amount);
            drain.usd_left = 0;
            partial
        };
        if taken > 0 {
            drain.taken.insert(asset.clone(), taken);
        }
    }
    Ok(drain)
}

fn checked_sub(
    asset: &str,
    available: Amount,
    needed: Amount,
) -> Result<Amount, PortalError> {
    available
        .checked_sub(needed)
        .ok_or_else(|| PortalError::InsufficientCollateral {
            asset: asset.to_string(),
            needed,
            available,
        })
}

fn checked_add(value: Amount, delta: Amount) -> Result<Amount, PortalError> {
    value
        .checked_add(delta)
        .ok_or(PortalError::ArithmeticOverflow("collateral add"))
}

impl CustodianState {
    /// Deposit collateral and record remote addresses.
    ///
    /// Remote addresses are replaced while the custodian holds no collateral
    /// at all; otherwise only unset tokens are filled in.
    pub fn add_collateral(
        &mut self,
        asset: &str,
        amount: Amount,
        remote_addresses: &BTreeMap<String, String>,
    ) -> Result<(), PortalError> {
        if self.has_no_collateral() && !remote_addresses.is_empty() {
            self.remote_addresses = remote_addresses.clone();
        } else {
            for (token, address) in remote_addresses {
                self.remote_addresses
                    .entry(token.clone())
                    .or_insert_with(|| address.clone());
            }
        }

        if asset == PRV_ID {
            self.total_collateral = checked_add(self.total_collateral, amount)?;
            self.free_collateral = checked_add(self.free_collateral, amount)?;
        } else {
            let total = self.total_token_collaterals.entry(asset.to_string()).or_insert(0);
            *total = checked_add(*total, amount)?;
            let free = self.free_token_collaterals.entry(asset.to_string()).or_insert(0);
            *free = checked_add(*free, amount)?;
        }
        Ok(())
    }

    /// Withdraw free collateral.
    pub fn withdraw_collateral(&mut self, asset: &str, amount: Amount) -> Result<(), PortalError> {
        let free = checked_sub(asset, self.free_of(asset), amount)?;
        let total = checked_sub(asset, self.total_of(asset), amount)?;
        if asset == PRV_ID {
            self.free_collateral = free;
            self.total_collateral = total;
        } else {
            self.free_token_collaterals.insert(asset.to_string(), free);
            self.total_token_collaterals.insert(asset.to_string(), total);
        }
        Ok(())
    }

    /// Move free collateral to locked for a portal token.
    pub fn lock_collateral(
        &mut self,
        ptoken: &str,
        asset: &str,
        amount: Amount,
    ) -> Result<(), PortalError> {
        let free = checked_sub(asset, self.free_of(asset), amount)?;
        let locked = checked_add(self.locked_of(ptoken, asset), amount)?;
        if asset == PRV_ID {
            self.free_collateral = free;
            self.locked_collaterals.insert(ptoken.to_string(), locked);
        } else {
            self.free_token_collaterals.insert(asset.to_string(), free);
            self.locked_token_collaterals
                .entry(ptoken.to_string())
                .or_default()
                .insert(asset.to_string(), locked);
        }
        Ok(())
    }

    /// Move locked collateral back to free.
    pub fn release_collateral(
        &mut self,
        ptoken: &str,
        asset: &str,
        amount: Amount,
    ) -> Result<(), PortalError> {
        self.seize_collateral(ptoken, asset, 0, amount)
    }

    /// Lock the collateral planned for a porting. Holdings are untouched.
    pub fn lock_for_porting(
        &mut self,
        ptoken: &str,
        detail: &MatchingPortingCustodianDetail,
    ) -> Result<(), PortalError> {
        for (asset, amount) in collateral_walk_order(&detail.locked_assets()) {
            self.lock_collateral(ptoken, &asset, amount)?;
        }
        Ok(())
    }

    /// Release the collateral of an expired porting.
    pub fn release_porting_lock(
        &mut self,
        ptoken: &str,
        detail: &MatchingPortingCustodianDetail,
    ) -> Result<(), PortalError> {
        for (asset, amount) in collateral_walk_order(&detail.locked_assets()) {
            self.release_collateral(ptoken, &asset, amount)?;
        }
        Ok(())
    }

    /// Credit public tokens once the user's delivery is proven.
    pub fn credit_holding_tokens(&mut self, ptoken: &str, amount: Amount) -> Result<(), PortalError> {
        let holding = self.holding_public_tokens.entry(ptoken.to_string()).or_insert(0);
        *holding = holding
            .checked_add(amount)
            .ok_or(PortalError::ArithmeticOverflow("holding add"))?;
        Ok(())
    }

    /// Debit public tokens when they are matched to a redeem or liquidated.
    pub fn debit_holding_tokens(&mut self, ptoken: &str, amount: Amount) -> Result<(), PortalError> {
        let available = self.holding_of(ptoken);
        let holding = available
            .checked_sub(amount)
            .ok_or_else(|| PortalError::InsufficientHolding {
                token: ptoken.to_string(),
                needed: amount,
                available,
            })?;
        self.holding_public_tokens.insert(ptoken.to_string(), holding);
        Ok(())
    }

    /// Top up a portal token position with a fresh deposit and/or free
    /// collateral. Returns the amount added to locked.
    pub fn topup(
        &mut self,
        ptoken: &str,
        asset: &str,
        deposit: Amount,
        free_used: Amount,
    ) -> Result<Amount, PortalError> {
        let topup = checked_add(deposit, free_used)?;
        self.add_collateral(asset, deposit, &BTreeMap::new())?;
        self.lock_collateral(ptoken, asset, topup)?;
        Ok(topup)
    }

    /// Locked collateral for a portal token net of what waiting portings
    /// have earmarked, PRV keyed by [`PRV_ID`].
    pub fn available_locked(
        &self,
        ptoken: &str,
        waiting_locks: &BTreeMap<String, Amount>,
    ) -> Result<BTreeMap<String, Amount>, PortalError> {
        let mut available = BTreeMap::new();
        for (asset, locked) in self.locked_assets(ptoken) {
            let waiting = waiting_locks.get(&asset).copied().unwrap_or(0);
            let net = locked.checked_sub(waiting).ok_or_else(|| {
                PortalError::ConsistencyViolation(format!(
                    "custodian {} {asset} locked {locked} below waiting porting lock {waiting}",
                    self.incognito_address
                ))
            })?;
            available.insert(asset, net);
        }
        Ok(available)
    }

    /// Release `unlock_usd` worth of locked collateral, PRV first.
    ///
    /// Collateral earmarked for waiting portings is never touched. Returns
    /// the amount released per asset.
    pub fn unlock_collateral(
        &mut self,
        tool: &ExchangeRateTool<'_>,
        ptoken: &str,
        unlock_usd: UsdAmount,
        waiting_locks: &BTreeMap<String, Amount>,
    ) -> Result<BTreeMap<String, Amount>, PortalError> {
        let available = self.available_locked(ptoken, waiting_locks)?;
        let drain = drain_by_usd(tool, &collateral_walk_order(&available), unlock_usd)?;
        if drain.usd_left > 0 {
            return Err(PortalError::CollateralExhausted {
                usd_left: drain.usd_left,
            });
        }
        for (asset, amount) in collateral_walk_order(&drain.taken) {
            self.release_collateral(ptoken, &asset, amount)?;
        }
        Ok(drain.taken)
    }

    /// Remove `liquidated` from locked and total, and move `remain` from
    /// locked back to free.
    pub fn seize_collateral(
        &mut self,
        ptoken: &str,
        asset: &str,
        liquidated: Amount,
        remain: Amount,
    ) -> Result<(), PortalError> {
        let released = checked_add(liquidated, remain)?;
        let locked = checked_sub(asset, self.locked_of(ptoken, asset), released)?;
        let total = checked_sub(asset, self.total_of(asset), liquidated)?;
        let free = checked_add(self.free_of(asset), remain)?;
        if asset == PRV_ID {
            self.locked_collaterals.insert(ptoken.to_string(), locked);
            self.total_collateral = total;
            self.free_collateral = free;
        } else {
            self.locked_token_collaterals
                .entry(ptoken.to_string())
                .or_default()
                .insert(asset.to_string(), locked);
            self.total_token_collaterals.insert(asset.to_string(), total);
            self.free_token_collaterals.insert(asset.to_string(), free);
        }
        Ok(())
    }

    /// Accumulate a reward.
    pub fn add_reward(&mut self, token: &str, amount: Amount) -> Result<(), PortalError> {
        let reward = self.reward_amount.entry(token.to_string()).or_insert(0);
        *reward = reward
            .checked_add(amount)
            .ok_or(PortalError::ArithmeticOverflow("reward add"))?;
        Ok(())
    }

    /// Zero a reward and return what it held.
    pub fn take_reward(&mut self, token: &str) -> Amount {
        self.reward_amount.remove(token).unwrap_or(0)
    }
}
