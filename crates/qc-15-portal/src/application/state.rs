//! # Portal State Aggregate
//!
//! [`CurrentPortalState`] owns every piece of portal state for one beacon
//! block. Processors and sweeps mutate it only through the methods below,
//! each of which either applies completely or returns an error.

use crate::algorithms::{
    collateral_ratio, compute_pool_redemption, pick_final_exchange_rates, unlock_amount_usd,
    ExchangeRateTool, LiquidationSplit,
};
use crate::config::PortalParams;
use crate::domain::{
    Amount, CustodianState, ExchangeRatesRequest, FinalExchangeRates, LiquidationPool,
    LockedCollateralState, MatchingRedeemCustodianDetail, PortalError, RedeemRequest, UsdAmount,
    WaitingPortingRequest, PRV_ID,
};
use crate::ports::outbound::PortalSnapshot;
use std::collections::BTreeMap;

fn pool_add(value: Amount, delta: Amount) -> Result<Amount, PortalError> {
    value
        .checked_add(delta)
        .ok_or(PortalError::ArithmeticOverflow("liquidation pool add"))
}

/// A custodian's exposure for one portal token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustodianPosition {
    /// Locked collateral net of waiting porting locks, PRV keyed by [`PRV_ID`].
    pub available: BTreeMap<String, Amount>,
    /// USD value of `available`.
    pub locked_usd: UsdAmount,
    /// Public tokens currently held.
    pub holding: Amount,
    /// Tokens already debited into waiting redeems.
    pub waiting_share: Amount,
    /// Tokens already debited into matched redeems.
    pub matched_share: Amount,
}

impl CustodianPosition {
    /// Holding plus every redeem share still backed by this collateral.
    pub fn total_holding(&self) -> Amount {
        self.holding + self.waiting_share + self.matched_share
    }
}

/// In-memory portal state for one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CurrentPortalState {
    pub(crate) custodians: BTreeMap<String, CustodianState>,
    pub(crate) waiting_portings: BTreeMap<String, WaitingPortingRequest>,
    pub(crate) waiting_redeems: BTreeMap<String, RedeemRequest>,
    pub(crate) matched_redeems: BTreeMap<String, RedeemRequest>,
    pub(crate) final_exchange_rates: Option<FinalExchangeRates>,
    pub(crate) liquidation_pool: LiquidationPool,
    pub(crate) locked_collateral: LockedCollateralState,
    pub(crate) ratio_warnings: BTreeMap<String, BTreeMap<String, u128>>,
    pub(crate) exchange_rates_requests: BTreeMap<String, ExchangeRatesRequest>,
}

impl CurrentPortalState {
    /// Build from persisted state. Exchange rate submissions start empty.
    pub fn from_snapshot(snapshot: PortalSnapshot) -> Self {
        Self {
            custodians: snapshot.custodians,
            waiting_portings: snapshot.waiting_portings,
            waiting_redeems: snapshot.waiting_redeems,
            matched_redeems: snapshot.matched_redeems,
            final_exchange_rates: snapshot.final_exchange_rates,
            liquidation_pool: snapshot.liquidation_pool,
            locked_collateral: snapshot.locked_collateral,
            ratio_warnings: snapshot.ratio_warnings,
            exchange_rates_requests: BTreeMap::new(),
        }
    }

    /// State to persist.
    pub fn to_snapshot(&self) -> PortalSnapshot {
        PortalSnapshot {
            custodians: self.custodians.clone(),
            waiting_portings: self.waiting_portings.clone(),
            waiting_redeems: self.waiting_redeems.clone(),
            matched_redeems: self.matched_redeems.clone(),
            final_exchange_rates: self.final_exchange_rates.clone(),
            liquidation_pool: self.liquidation_pool.clone(),
            locked_collateral: self.locked_collateral.clone(),
            ratio_warnings: self.ratio_warnings.clone(),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Custodian by address.
    pub fn custodian(&self, address: &str) -> Option<&CustodianState> {
        self.custodians.get(address)
    }

    /// Whole custodian pool.
    pub fn custodians(&self) -> &BTreeMap<String, CustodianState> {
        &self.custodians
    }

    /// Waiting porting by ID.
    pub fn waiting_porting(&self, porting_id: &str) -> Option<&WaitingPortingRequest> {
        self.waiting_portings.get(porting_id)
    }

    /// All waiting portings.
    pub fn waiting_portings(&self) -> &BTreeMap<String, WaitingPortingRequest> {
        &self.waiting_portings
    }

    /// Waiting redeem by ID.
    pub fn waiting_redeem(&self, redeem_id: &str) -> Option<&RedeemRequest> {
        self.waiting_redeems.get(redeem_id)
    }

    /// All waiting redeems.
    pub fn waiting_redeems(&self) -> &BTreeMap<String, RedeemRequest> {
        &self.waiting_redeems
    }

    /// Matched redeem by ID.
    pub fn matched_redeem(&self, redeem_id: &str) -> Option<&RedeemRequest> {
        self.matched_redeems.get(redeem_id)
    }

    /// All matched redeems.
    pub fn matched_redeems(&self) -> &BTreeMap<String, RedeemRequest> {
        &self.matched_redeems
    }

    /// Final exchange rates, if any were ever recorded.
    pub fn final_exchange_rates(&self) -> Option<&FinalExchangeRates> {
        self.final_exchange_rates.as_ref()
    }

    /// Liquidation pool.
    pub fn liquidation_pool(&self) -> &LiquidationPool {
        &self.liquidation_pool
    }

    /// Reward epoch accumulator.
    pub fn locked_collateral(&self) -> &LockedCollateralState {
        &self.locked_collateral
    }

    /// Warning-tier ratios from the last liquidation sweep.
    pub fn ratio_warnings(&self) -> &BTreeMap<String, BTreeMap<String, u128>> {
        &self.ratio_warnings
    }

    /// Rate submissions accepted in this block.
    pub fn exchange_rates_requests(&self) -> &BTreeMap<String, ExchangeRatesRequest> {
        &self.exchange_rates_requests
    }

    /// Owned copy of the final rates, for converters that outlive a borrow
    /// of the state.
    pub fn current_rates(&self) -> Result<FinalExchangeRates, PortalError> {
        self.final_exchange_rates
            .clone()
            .ok_or(PortalError::ExchangeRatesMissing)
    }

    /// Whether a redeem ID is in either redeem list.
    pub fn redeem_in_flight(&self, redeem_id: &str) -> bool {
        self.waiting_redeems.contains_key(redeem_id) || self.matched_redeems.contains_key(redeem_id)
    }

    /// Collateral a custodian has earmarked for waiting portings of `ptoken`,
    /// summed per asset.
    pub fn waiting_porting_locks(&self, custodian: &str, ptoken: &str) -> BTreeMap<String, Amount> {
        let mut locks: BTreeMap<String, Amount> = BTreeMap::new();
        for porting in self.waiting_portings.values().filter(|p| p.token_id == ptoken) {
            for detail in porting.custodians.iter().filter(|d| d.incognito_address == custodian) {
                for (asset, amount) in detail.locked_assets() {
                    *locks.entry(asset).or_insert(0) += amount;
                }
            }
        }
        locks
    }

    /// A custodian's shares in waiting and matched redeems of `ptoken`.
    pub fn redeem_shares(&self, custodian: &str, ptoken: &str) -> (Amount, Amount) {
        let share = |redeems: &BTreeMap<String, RedeemRequest>| -> Amount {
            redeems
                .values()
                .filter(|r| r.token_id == ptoken)
                .map(|r| r.share_of(custodian))
                .sum()
        };
        (share(&self.waiting_redeems), share(&self.matched_redeems))
    }

    /// Exposure of a custodian for one portal token.
    pub fn position(
        &self,
        tool: &ExchangeRateTool<'_>,
        custodian: &str,
        ptoken: &str,
    ) -> Result<CustodianPosition, PortalError> {
        let state = self
            .custodians
            .get(custodian)
            .ok_or_else(|| PortalError::CustodianNotFound(custodian.to_string()))?;
        let available =
            state.available_locked(ptoken, &self.waiting_porting_locks(custodian, ptoken))?;
        let locked_usd = tool.total_usd(&available)?;
        let (waiting_share, matched_share) = self.redeem_shares(custodian, ptoken);
        Ok(CustodianPosition {
            available,
            locked_usd,
            holding: state.holding_of(ptoken),
            waiting_share,
            matched_share,
        })
    }

    /// USD value of the collateral backing `pub_amount` of a position.
    pub fn unlock_usd_for(
        &self,
        tool: &ExchangeRateTool<'_>,
        custodian: &str,
        ptoken: &str,
        pub_amount: Amount,
    ) -> Result<(UsdAmount, CustodianPosition), PortalError> {
        let position = self.position(tool, custodian, ptoken)?;
        let usd = unlock_amount_usd(pub_amount, position.locked_usd, position.total_holding())
            .map_err(|e| match e {
                PortalError::ZeroTotalHolding(_) => PortalError::ZeroTotalHolding(ptoken.into()),
                other => other,
            })?;
        Ok((usd, position))
    }

    fn custodian_mut(&mut self, address: &str) -> Result<&mut CustodianState, PortalError> {
        self.custodians
            .get_mut(address)
            .ok_or_else(|| PortalError::CustodianNotFound(address.to_string()))
    }

    /// Apply `f` to a copy of a custodian and store it only on success.
    fn update_custodian<T>(
        &mut self,
        address: &str,
        f: impl FnOnce(&mut CustodianState) -> Result<T, PortalError>,
    ) -> Result<T, PortalError> {
        let mut custodian = self.custodian_mut(address)?.clone();
        let value = f(&mut custodian)?;
        self.custodians.insert(address.to_string(), custodian);
        Ok(value)
    }

    // =========================================================================
    // Collateral
    // =========================================================================

    /// Deposit collateral, creating the custodian on first deposit.
    pub fn deposit_collateral(
        &mut self,
        address: &str,
        asset: &str,
        amount: Amount,
        remote_addresses: &BTreeMap<String, String>,
    ) -> Result<(), PortalError> {
        let mut custodian = self
            .custodians
            .get(address)
            .cloned()
            .unwrap_or_else(|| CustodianState::new(address));
        custodian.add_collateral(asset, amount, remote_addresses)?;
        self.custodians.insert(address.to_string(), custodian);
        Ok(())
    }

    /// Withdraw free collateral.
    pub fn withdraw_collateral(
        &mut self,
        address: &str,
        asset: &str,
        amount: Amount,
    ) -> Result<(), PortalError> {
        self.update_custodian(address, |c| c.withdraw_collateral(asset, amount))
    }

    /// Top up a custodian's position for a portal token.
    pub fn topup_custodian(
        &mut self,
        address: &str,
        ptoken: &str,
        asset: &str,
        deposit: Amount,
        free_used: Amount,
    ) -> Result<Amount, PortalError> {
        self.update_custodian(address, |c| c.topup(ptoken, asset, deposit, free_used))
    }

    /// Top up a custodian's lock for one waiting porting.
    pub fn topup_waiting_porting(
        &mut self,
        porting_id: &str,
        address: &str,
        asset: &str,
        deposit: Amount,
        free_used: Amount,
    ) -> Result<Amount, PortalError> {
        let mut porting = self
            .waiting_portings
            .get(porting_id)
            .cloned()
            .ok_or_else(|| PortalError::PortingNotFound(porting_id.to_string()))?;
        let ptoken = porting.token_id.clone();
        let detail = porting
            .custodians
            .iter_mut()
            .find(|d| d.incognito_address == address)
            .ok_or_else(|| PortalError::CustodianNotFound(address.to_string()))?;

        let added =
            self.update_custodian(address, |c| c.topup(&ptoken, asset, deposit, free_used))?;
        if asset == PRV_ID {
            detail.locked_amount_collateral += added;
        } else {
            *detail
                .locked_token_collaterals
                .entry(asset.to_string())
                .or_insert(0) += added;
        }
        self.waiting_portings.insert(porting_id.to_string(), porting);
        Ok(added)
    }

    /// Release the collateral above the over-rate threshold.
    ///
    /// The custodian keeps `hold_usd * min_unlock_over_rate_collaterals / 10`
    /// locked; the rest of the unearmarked lock returns to free.
    pub fn unlock_over_rate(
        &mut self,
        params: &PortalParams,
        address: &str,
        ptoken: &str,
    ) -> Result<BTreeMap<String, Amount>, PortalError> {
        let rates = self.current_rates()?;
        let tool = ExchangeRateTool::new(&rates, params);
        let position = self.position(&tool, address, ptoken)?;
        let hold_usd = tool.to_usd(ptoken, position.total_holding())?;
        let min_hold_usd = hold_usd
            .checked_mul(params.min_unlock_over_rate_collaterals as u128)
            .ok_or(PortalError::ArithmeticOverflow("over-rate threshold"))?
            / 10;
        if min_hold_usd >= position.locked_usd {
            return Err(PortalError::ZeroUnlockAmount);
        }
        let unlock_usd = position.locked_usd - min_hold_usd;
        let waiting = self.waiting_porting_locks(address, ptoken);
        let released =
            self.update_custodian(address, |c| c.unlock_collateral(&tool, ptoken, unlock_usd, &waiting))?;
        if released.is_empty() {
            return Err(PortalError::ZeroUnlockAmount);
        }
        Ok(released)
    }

    // =========================================================================
    // Porting
    // =========================================================================

    /// Lock every matched custodian's collateral and record the porting.
    pub fn add_waiting_porting(&mut self, porting: WaitingPortingRequest) -> Result<(), PortalError> {
        let mut updated = self.custodians.clone();
        for detail in &porting.custodians {
            updated
                .get_mut(&detail.incognito_address)
                .ok_or_else(|| PortalError::CustodianNotFound(detail.incognito_address.clone()))?
                .lock_for_porting(&porting.token_id, detail)?;
        }
        self.custodians = updated;
        self.waiting_portings
            .insert(porting.unique_porting_id.clone(), porting);
        Ok(())
    }

    /// Credit each custodian's holding and close the porting.
    pub fn settle_porting(&mut self, porting_id: &str) -> Result<WaitingPortingRequest, PortalError> {
        let porting = self
            .waiting_portings
            .get(porting_id)
            .cloned()
            .ok_or_else(|| PortalError::PortingNotFound(porting_id.to_string()))?;
        let mut updated = self.custodians.clone();
        for detail in &porting.custodians {
            updated
                .get_mut(&detail.incognito_address)
                .ok_or_else(|| PortalError::CustodianNotFound(detail.incognito_address.clone()))?
                .credit_holding_tokens(&porting.token_id, detail.amount)?;
        }
        self.custodians = updated;
        self.waiting_portings.remove(porting_id);
        Ok(porting)
    }

    /// Release every custodian's lock and drop the porting.
    pub fn expire_porting(&mut self, porting_id: &str) -> Result<WaitingPortingRequest, PortalError> {
        let porting = self
            .waiting_portings
            .get(porting_id)
            .cloned()
            .ok_or_else(|| PortalError::PortingNotFound(porting_id.to_string()))?;
        let mut updated = self.custodians.clone();
        for detail in &porting.custodians {
            updated
                .get_mut(&detail.incognito_address)
                .ok_or_else(|| PortalError::CustodianNotFound(detail.incognito_address.clone()))?
                .release_porting_lock(&porting.token_id, detail)?;
        }
        self.custodians = updated;
        self.waiting_portings.remove(porting_id);
        Ok(porting)
    }

    // =========================================================================
    // Redeem
    // =========================================================================

    /// Record a new waiting redeem.
    pub fn add_waiting_redeem(&mut self, redeem: RedeemRequest) {
        self.waiting_redeems
            .insert(redeem.unique_redeem_id.clone(), redeem);
    }

    /// Attach a volunteering custodian to a waiting redeem. A full match
    /// moves the redeem to the matched list.
    pub fn match_waiting_redeem(
        &mut self,
        redeem_id: &str,
        detail: MatchingRedeemCustodianDetail,
        is_full: bool,
    ) -> Result<(), PortalError> {
        let mut redeem = self
            .waiting_redeems
            .get(redeem_id)
            .cloned()
            .ok_or_else(|| PortalError::RedeemNotFound(redeem_id.to_string()))?;
        self.update_custodian(&detail.incognito_address, |c| {
            c.debit_holding_tokens(&redeem.token_id, detail.amount)
        })?;
        redeem.custodians.push(detail);
        if is_full {
            self.waiting_redeems.remove(redeem_id);
            self.matched_redeems.insert(redeem_id.to_string(), redeem);
        } else {
            self.waiting_redeems.insert(redeem_id.to_string(), redeem);
        }
        Ok(())
    }

    /// Assign protocol-picked custodians to a waiting redeem and move it to
    /// the matched list.
    pub fn assign_redeem_custodians(
        &mut self,
        redeem_id: &str,
        picks: &[MatchingRedeemCustodianDetail],
    ) -> Result<(), PortalError> {
        let mut redeem = self
            .waiting_redeems
            .get(redeem_id)
            .cloned()
            .ok_or_else(|| PortalError::RedeemNotFound(redeem_id.to_string()))?;
        let mut updated = self.custodians.clone();
        for pick in picks {
            updated
                .get_mut(&pick.incognito_address)
                .ok_or_else(|| PortalError::CustodianNotFound(pick.incognito_address.clone()))?
                .debit_holding_tokens(&redeem.token_id, pick.amount)?;
        }
        redeem.custodians.extend(picks.iter().cloned());
        self.custodians = updated;
        self.waiting_redeems.remove(redeem_id);
        self.matched_redeems.insert(redeem_id.to_string(), redeem);
        Ok(())
    }

    /// Drop a waiting redeem and return matched shares to the custodians.
    pub fn cancel_waiting_redeem(&mut self, redeem_id: &str) -> Result<RedeemRequest, PortalError> {
        let redeem = self
            .waiting_redeems
            .get(redeem_id)
            .cloned()
            .ok_or_else(|| PortalError::RedeemNotFound(redeem_id.to_string()))?;
        let mut updated = self.custodians.clone();
        for detail in &redeem.custodians {
            updated
                .get_mut(&detail.incognito_address)
                .ok_or_else(|| PortalError::CustodianNotFound(detail.incognito_address.clone()))?
                .credit_holding_tokens(&redeem.token_id, detail.amount)?;
        }
        self.custodians = updated;
        self.waiting_redeems.remove(redeem_id);
        Ok(redeem)
    }

    /// Remove a custodian from a matched redeem, dropping the redeem when no
    /// custodian is left.
    pub fn remove_matched_custodian(
        &mut self,
        redeem_id: &str,
        address: &str,
    ) -> Result<(), PortalError> {
        let redeem = self
            .matched_redeems
            .get_mut(redeem_id)
            .ok_or_else(|| PortalError::RedeemNotFound(redeem_id.to_string()))?;
        let before = redeem.custodians.len();
        redeem.custodians.retain(|d| d.incognito_address != address);
        if redeem.custodians.len() == before {
            return Err(PortalError::CustodianNotFound(address.to_string()));
        }
        if redeem.custodians.is_empty() {
            self.matched_redeems.remove(redeem_id);
        }
        Ok(())
    }

    /// Release a custodian's collateral for a matched redeem it has paid out.
    pub fn unlock_after_redeem(
        &mut self,
        tool: &ExchangeRateTool<'_>,
        redeem_id: &str,
        address: &str,
    ) -> Result<BTreeMap<String, Amount>, PortalError> {
        let redeem = self
            .matched_redeems
            .get(redeem_id)
            .ok_or_else(|| PortalError::RedeemNotFound(redeem_id.to_string()))?;
        let ptoken = redeem.token_id.clone();
        let share = redeem.share_of(address);
        let (unlock_usd, _) = self.unlock_usd_for(tool, address, &ptoken, share)?;
        let waiting = self.waiting_porting_locks(address, &ptoken);
        let released = self.update_custodian(address, |c| {
            c.unlock_collateral(tool, &ptoken, unlock_usd, &waiting)
        })?;
        self.remove_matched_custodian(redeem_id, address)?;
        Ok(released)
    }

    // =========================================================================
    // Liquidation
    // =========================================================================

    /// Seize the liquidated part of a split and free the remainder.
    pub fn seize_split(
        &mut self,
        address: &str,
        ptoken: &str,
        split: &LiquidationSplit,
    ) -> Result<(), PortalError> {
        self.update_custodian(address, |c| {
            for asset in split.assets() {
                let liquidated = split.liquidated.get(&asset).copied().unwrap_or(0);
                let remain = split.remain.get(&asset).copied().unwrap_or(0);
                c.seize_collateral(ptoken, &asset, liquidated, remain)?;
            }
            Ok(())
        })
    }

    /// Move a liquidated position into the pool.
    pub fn liquidate_into_pool(
        &mut self,
        address: &str,
        ptoken: &str,
        liquidated_pub_amount: Amount,
        split: &LiquidationSplit,
    ) -> Result<(), PortalError> {
        let mut pool = self
            .liquidation_pool
            .rates
            .get(ptoken)
            .cloned()
            .unwrap_or_default();
        pool.pub_token_amount = pool_add(pool.pub_token_amount, liquidated_pub_amount)?;
        pool.collateral_amount = pool_add(pool.collateral_amount, split.liquidated_prv())?;
        for (asset, amount) in split.liquidated_tokens() {
            let balance = pool.token_collaterals_amount.entry(asset).or_insert(0);
            *balance = pool_add(*balance, amount)?;
        }

        let snapshot = self.custodians.get(address).cloned();
        self.update_custodian(address, |c| {
            c.debit_holding_tokens(ptoken, liquidated_pub_amount)
        })?;
        if let Err(e) = self.seize_split(address, ptoken, split) {
            if let Some(custodian) = snapshot {
                self.custodians.insert(address.to_string(), custodian);
            }
            return Err(e);
        }

        self.liquidation_pool.rates.insert(ptoken.to_string(), pool);
        Ok(())
    }

    /// Redeem public tokens against the pool. Returns collateral released
    /// per asset.
    pub fn redeem_from_pool(
        &mut self,
        tool: &ExchangeRateTool<'_>,
        ptoken: &str,
        redeem_amount: Amount,
    ) -> Result<BTreeMap<String, Amount>, PortalError> {
        let detail = self
            .liquidation_pool
            .rates
            .get(ptoken)
            .ok_or_else(|| PortalError::LiquidationPoolEmpty(ptoken.to_string()))?;
        let released = compute_pool_redemption(tool, ptoken, detail, redeem_amount)?;

        let mut detail = detail.clone();
        detail.pub_token_amount -= redeem_amount;
        for (asset, amount) in &released {
            let balance = if asset == PRV_ID {
                &mut detail.collateral_amount
            } else {
                detail.token_collaterals_amount.entry(asset.clone()).or_insert(0)
            };
            *balance = balance.checked_sub(*amount).ok_or_else(|| {
                PortalError::ConsistencyViolation(format!("pool {ptoken} {asset} over-released"))
            })?;
        }
        self.liquidation_pool.rates.insert(ptoken.to_string(), detail);
        Ok(released)
    }

    /// Replace the warning-tier ratios with this block's sweep.
    pub fn set_ratio_warnings(&mut self, warnings: BTreeMap<String, BTreeMap<String, u128>>) {
        self.ratio_warnings = warnings;
    }

    /// Collateral ratio in percent of a position, `None` when nothing is held.
    pub fn position_ratio(
        &self,
        tool: &ExchangeRateTool<'_>,
        position: &CustodianPosition,
        ptoken: &str,
    ) -> Result<Option<u128>, PortalError> {
        let total = position.total_holding();
        if total == 0 {
            return Ok(None);
        }
        let holding_usd = tool.to_usd(ptoken, total)?;
        if holding_usd == 0 {
            return Ok(None);
        }
        collateral_ratio(position.locked_usd, holding_usd).map(Some)
    }

    // =========================================================================
    // Rewards
    // =========================================================================

    /// Credit a reward to a custodian.
    pub fn add_reward(&mut self, address: &str, token: &str, amount: Amount) -> Result<(), PortalError> {
        self.update_custodian(address, |c| c.add_reward(token, amount))
    }

    /// Pay out a custodian's reward, failing when there is nothing to pay.
    pub fn withdraw_reward(&mut self, address: &str, token: &str) -> Result<Amount, PortalError> {
        let reward = self.update_custodian(address, |c| Ok(c.take_reward(token)))?;
        if reward == 0 {
            return Err(PortalError::ZeroUnlockAmount);
        }
        Ok(reward)
    }

    /// Add this block's USD value of every custodian's holdings to the
    /// epoch accumulator.
    pub fn accumulate_locked_collateral(
        &mut self,
        tool: &ExchangeRateTool<'_>,
    ) -> Result<(), PortalError> {
        let mut accumulator = self.locked_collateral.clone();
        for (address, custodian) in &self.custodians {
            let mut value: UsdAmount = 0;
            for (ptoken, holding) in &custodian.holding_public_tokens {
                if *holding == 0 {
                    continue;
                }
                value = value
                    .checked_add(tool.to_usd(ptoken, *holding)?)
                    .ok_or(PortalError::ArithmeticOverflow("locked collateral"))?;
            }
            if value == 0 {
                continue;
            }
            let entry = accumulator
                .locked_collateral_detail
                .entry(address.clone())
                .or_insert(0);
            *entry = entry
                .checked_add(value)
                .ok_or(PortalError::ArithmeticOverflow("locked collateral"))?;
            accumulator.total_locked_collateral_for_rewards = accumulator
                .total_locked_collateral_for_rewards
                .checked_add(value)
                .ok_or(PortalError::ArithmeticOverflow("locked collateral"))?;
        }
        self.locked_collateral = accumulator;
        Ok(())
    }

    /// Take the epoch accumulator, leaving it empty.
    pub fn reset_locked_collateral(&mut self) -> LockedCollateralState {
        std::mem::take(&mut self.locked_collateral)
    }

    // =========================================================================
    // Exchange rates
    // =========================================================================

    /// Record an accepted rate submission.
    pub fn add_exchange_rates_request(&mut self, tx_req_id: &str, request: ExchangeRatesRequest) {
        self.exchange_rates_requests
            .insert(tx_req_id.to_string(), request);
    }

    /// Fold this block's submissions into the final rates.
    pub fn apply_exchange_rates_requests(&mut self) {
        let requests = std::mem::take(&mut self.exchange_rates_requests);
        self.final_exchange_rates =
            pick_final_exchange_rates(&requests, self.final_exchange_rates.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MatchingPortingCustodianDetail, PORTAL_BTC_ID};

    const PBTC: &str = PORTAL_BTC_ID;

    fn rates() -> FinalExchangeRates {
        FinalExchangeRates {
            rates: BTreeMap::from([
                (PRV_ID.to_string(), 1_000_000),
                (PBTC.to_string(), 50_000_000),
            ]),
        }
    }

    fn funded_state() -> CurrentPortalState {
        let mut state = CurrentPortalState {
            final_exchange_rates: Some(rates()),
            ..Default::default()
        };
        let remote = BTreeMap::from([(PBTC.to_string(), "btc-1".to_string())]);
        state
            .deposit_collateral("cus1", PRV_ID, 10_000, &remote)
            .unwrap();
        state
    }

    fn porting(id: &str, amount: Amount, lock: Amount) -> WaitingPortingRequest {
        WaitingPortingRequest {
            unique_porting_id: id.into(),
            token_id: PBTC.into(),
            porter_address: "user".into(),
            amount,
            custodians: vec![MatchingPortingCustodianDetail {
                incognito_address: "cus1".into(),
                remote_address: "btc-1".into(),
                amount,
                locked_amount_collateral: lock,
                locked_token_collaterals: BTreeMap::new(),
            }],
            ..Default::default()
        }
    }

    fn redeem(id: &str, amount: Amount) -> RedeemRequest {
        RedeemRequest {
            unique_redeem_id: id.into(),
            token_id: PBTC.into(),
            redeemer_address: "user".into(),
            redeem_amount: amount,
            ..Default::default()
        }
    }

    fn detail(amount: Amount) -> MatchingRedeemCustodianDetail {
        MatchingRedeemCustodianDetail {
            incognito_address: "cus1".into(),
            remote_address: "btc-1".into(),
            amount,
        }
    }

    #[test]
    fn test_snapshot_roundtrip_drops_rate_requests() {
        let mut state = funded_state();
        state.add_exchange_rates_request("tx", ExchangeRatesRequest::default());
        let restored = CurrentPortalState::from_snapshot(state.to_snapshot());
        assert!(restored.exchange_rates_requests().is_empty());
        assert_eq!(restored.custodians(), state.custodians());
    }

    #[test]
    fn test_porting_lifecycle() {
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 100, 7500)).unwrap();
        assert_eq!(state.custodian("cus1").unwrap().free_collateral, 2500);
        assert_eq!(
            state.waiting_porting_locks("cus1", PBTC).get(PRV_ID),
            Some(&7500)
        );

        state.settle_porting("p1").unwrap();
        assert!(state.waiting_porting("p1").is_none());
        assert_eq!(state.custodian("cus1").unwrap().holding_of(PBTC), 100);
        assert_eq!(state.custodian("cus1").unwrap().locked_of(PBTC, PRV_ID), 7500);
        assert!(matches!(
            state.settle_porting("p1"),
            Err(PortalError::PortingNotFound(_))
        ));
    }

    #[test]
    fn test_failed_porting_lock_leaves_state() {
        let mut state = funded_state();
        let before = state.clone();
        let err = state.add_waiting_porting(porting("p1", 100, 20_000)).unwrap_err();
        assert!(matches!(err, PortalError::InsufficientCollateral { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn test_expire_porting_releases() {
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 100, 7500)).unwrap();
        state.expire_porting("p1").unwrap();
        let custodian = state.custodian("cus1").unwrap();
        assert_eq!(custodian.free_collateral, 10_000);
        assert_eq!(custodian.holding_of(PBTC), 0);
    }

    #[test]
    fn test_redeem_match_and_cancel() {
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 100, 7500)).unwrap();
        state.settle_porting("p1").unwrap();
        state.add_waiting_redeem(redeem("r1", 100));

        state.match_waiting_redeem("r1", detail(60), false).unwrap();
        assert_eq!(state.custodian("cus1").unwrap().holding_of(PBTC), 40);
        assert_eq!(state.redeem_shares("cus1", PBTC), (60, 0));

        let cancelled = state.cancel_waiting_redeem("r1").unwrap();
        assert_eq!(cancelled.matched_amount(), 60);
        assert_eq!(state.custodian("cus1").unwrap().holding_of(PBTC), 100);
        assert!(!state.redeem_in_flight("r1"));
    }

    #[test]
    fn test_full_match_and_unlock() {
        let params = PortalParams::default();
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 100, 7500)).unwrap();
        state.settle_porting("p1").unwrap();
        state.add_waiting_redeem(redeem("r1", 40));
        state.match_waiting_redeem("r1", detail(40), true).unwrap();
        assert!(state.matched_redeem("r1").is_some());

        let rates = rates();
        let tool = ExchangeRateTool::new(&rates, &params);
        let released = state.unlock_after_redeem(&tool, "r1", "cus1").unwrap();
        // 40 of 100 held tokens back 40% of the 7500 lock
        assert_eq!(released.get(PRV_ID), Some(&3000));
        assert!(state.matched_redeem("r1").is_none());
        assert_eq!(state.custodian("cus1").unwrap().locked_of(PBTC, PRV_ID), 4500);
    }

    #[test]
    fn test_topup_waiting_porting_extends_detail() {
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 100, 7500)).unwrap();
        let added = state
            .topup_waiting_porting("p1", "cus1", PRV_ID, 0, 500)
            .unwrap();
        assert_eq!(added, 500);
        assert_eq!(
            state.waiting_porting("p1").unwrap().custodians[0].locked_amount_collateral,
            8000
        );
        assert!(state
            .topup_waiting_porting("p1", "cus2", PRV_ID, 0, 1)
            .is_err());
    }

    #[test]
    fn test_unlock_over_rate() {
        let params = PortalParams::default();
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 20, 7500)).unwrap();
        state.settle_porting("p1").unwrap();
        // 20 pBTC are worth 1000 PRV; 250% of that stays locked
        let released = state.unlock_over_rate(&params, "cus1", PBTC).unwrap();
        assert_eq!(released.get(PRV_ID), Some(&5000));
        assert_eq!(state.custodian("cus1").unwrap().locked_of(PBTC, PRV_ID), 2500);

        assert_eq!(
            state.unlock_over_rate(&params, "cus1", PBTC).unwrap_err(),
            PortalError::ZeroUnlockAmount
        );
    }

    #[test]
    fn test_pool_redemption_updates_pool() {
        let params = PortalParams::default();
        let mut state = funded_state();
        state.liquidation_pool.rates.insert(
            PBTC.to_string(),
            crate::domain::LiquidationPoolDetail {
                collateral_amount: 1000,
                pub_token_amount: 10,
                token_collaterals_amount: BTreeMap::new(),
            },
        );
        let rates = rates();
        let tool = ExchangeRateTool::new(&rates, &params);
        let released = state.redeem_from_pool(&tool, PBTC, 4).unwrap();
        assert_eq!(released.get(PRV_ID), Some(&400));
        let pool = &state.liquidation_pool().rates[PBTC];
        assert_eq!(pool.pub_token_amount, 6);
        assert_eq!(pool.collateral_amount, 600);
    }

    #[test]
    fn test_pool_overflow_leaves_state_untouched() {
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 100, 7500)).unwrap();
        state.settle_porting("p1").unwrap();
        state.liquidation_pool.rates.insert(
            PBTC.to_string(),
            crate::domain::LiquidationPoolDetail {
                collateral_amount: 0,
                pub_token_amount: u64::MAX - 10,
                token_collaterals_amount: BTreeMap::new(),
            },
        );
        let before = state.clone();
        let split = LiquidationSplit {
            liquidated: BTreeMap::from([(PRV_ID.to_string(), 1000)]),
            remain: BTreeMap::new(),
        };

        let err = state
            .liquidate_into_pool("cus1", PBTC, 100, &split)
            .unwrap_err();
        assert!(matches!(err, PortalError::ArithmeticOverflow(_)));
        assert_eq!(state.custodian("cus1"), before.custodian("cus1"));
        assert_eq!(state.liquidation_pool(), before.liquidation_pool());
    }

    #[test]
    fn test_accumulate_and_reset_locked_collateral() {
        let params = PortalParams::default();
        let mut state = funded_state();
        state.add_waiting_porting(porting("p1", 100, 7500)).unwrap();
        state.settle_porting("p1").unwrap();
        let rates = rates();
        let tool = ExchangeRateTool::new(&rates, &params);
        state.accumulate_locked_collateral(&tool).unwrap();
        state.accumulate_locked_collateral(&tool).unwrap();
        let per_block = tool.to_usd(PBTC, 100).unwrap();
        assert_eq!(
            state.locked_collateral().total_locked_collateral_for_rewards,
            per_block * 2
        );
        let taken = state.reset_locked_collateral();
        assert_eq!(taken.locked_collateral_detail["cus1"], per_block * 2);
        assert_eq!(state.locked_collateral(), &LockedCollateralState::default());
    }

    #[test]
    fn test_withdraw_reward() {
        let mut state = funded_state();
        assert!(state.withdraw_reward("cus1", PRV_ID).is_err());
        state.add_reward("cus1", PRV_ID, 12).unwrap();
        assert_eq!(state.withdraw_reward("cus1", PRV_ID).unwrap(), 12);
    }
}
