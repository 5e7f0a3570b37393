//! # Liquidation Engine
//!
//! Collateral ratios, the liquidate/remain split of a force-closed position,
//! and pro-rata redemption against the liquidation pool.

use super::exchange_rate::{mul_div, to_amount, up_percent, ExchangeRateTool};
use super::ledger::collateral_walk_order;
use crate::domain::{
    Amount, LiquidationPoolDetail, PortalError, UsdAmount, PRV_ID,
};
use std::collections::BTreeMap;

/// `locked_usd * 100 / holding_usd`.
pub fn collateral_ratio(locked_usd: UsdAmount, holding_usd: UsdAmount) -> Result<u128, PortalError> {
    if holding_usd == 0 {
        return Err(PortalError::ArithmeticOverflow("ratio with zero holding"));
    }
    mul_div(locked_usd, 100, holding_usd)
}

/// USD value of collateral backing `pub_amount` out of `total_holding`.
pub fn unlock_amount_usd(
    pub_amount: Amount,
    locked_usd: UsdAmount,
    total_holding: Amount,
) -> Result<UsdAmount, PortalError> {
    if total_holding == 0 {
        return Err(PortalError::ZeroTotalHolding(String::new()));
    }
    let usd = mul_div(pub_amount as u128, locked_usd, total_holding as u128)?;
    if usd == 0 {
        return Err(PortalError::ZeroUnlockAmount);
    }
    Ok(usd)
}

/// Split of unlockable collateral into seized and returned parts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiquidationSplit {
    /// Seized amount per asset, PRV keyed by [`PRV_ID`].
    pub liquidated: BTreeMap<String, Amount>,
    /// Amount returned to free per asset.
    pub remain: BTreeMap<String, Amount>,
}

impl LiquidationSplit {
    /// Seized PRV.
    pub fn liquidated_prv(&self) -> Amount {
        self.liquidated.get(PRV_ID).copied().unwrap_or(0)
    }

    /// Seized token collateral.
    pub fn liquidated_tokens(&self) -> BTreeMap<String, Amount> {
        self.liquidated
            .iter()
            .filter(|(asset, _)| asset.as_str() != PRV_ID)
            .map(|(asset, amount)| (asset.clone(), *amount))
            .collect()
    }

    /// Returned PRV.
    pub fn remain_prv(&self) -> Amount {
        self.remain.get(PRV_ID).copied().unwrap_or(0)
    }

    /// Returned token collateral.
    pub fn remain_tokens(&self) -> BTreeMap<String, Amount> {
        self.remain
            .iter()
            .filter(|(asset, _)| asset.as_str() != PRV_ID)
            .map(|(asset, amount)| (asset.clone(), *amount))
            .collect()
    }

    /// Every asset touched, PRV first.
    pub fn assets(&self) -> Vec<String> {
        let mut all: BTreeMap<String, Amount> = self.liquidated.clone();
        for asset in self.remain.keys() {
            all.entry(asset.clone()).or_insert(0);
        }
        collateral_walk_order(&all)
            .into_iter()
            .map(|(asset, _)| asset)
            .collect()
    }
}

/// Parameters for splitting a liquidated position.
pub struct LiquidationSplitParams<'a> {
    /// Portal token of the position.
    pub ptoken: &'a str,
    /// Public tokens being liquidated.
    pub liquidated_pub_amount: Amount,
    /// Locked collateral net of waiting portings, PRV keyed by [`PRV_ID`].
    pub available: &'a BTreeMap<String, Amount>,
    /// USD value of collateral backing the liquidated tokens.
    pub total_unlock_usd: UsdAmount,
    /// Percent of the public token value to seize.
    pub max_percent_liquidated: u64,
}

/// Split `total_unlock_usd` worth of collateral into a seized part, worth
/// at most `max_percent_liquidated` of the liquidated tokens, and a remainder
/// returned to the custodian. Both parts walk PRV first.
pub fn split_liquidated_collateral(
    tool: &ExchangeRateTool<'_>,
    params: &LiquidationSplitParams<'_>,
) -> Result<LiquidationSplit, PortalError> {
    let seize_cap = tool.to_usd(
        params.ptoken,
        up_percent(params.liquidated_pub_amount, params.max_percent_liquidated)?,
    )?;
    let mut liquidate_usd = seize_cap.min(params.total_unlock_usd);
    let mut remain_usd = params.total_unlock_usd - liquidate_usd;

    let mut split = LiquidationSplit::default();
    for (asset, amount) in collateral_walk_order(params.available) {
        if liquidate_usd == 0 && remain_usd == 0 {
            break;
        }
        if amount == 0 {
            continue;
        }
        let mut value = tool.to_usd(&asset, amount)?;
        let mut left = amount;

        if liquidate_usd > 0 {
            if liquidate_usd >= value {
                split.liquidated.insert(asset.clone(), left);
                liquidate_usd -= value;
                continue;
            }
            let taken = tool.from_usd(&asset, liquidate_usd)?.min(left);
            if taken > 0 {
                split.liquidated.insert(asset.clone(), taken);
            }
            left -= taken;
            value -= liquidate_usd;
            liquidate_usd = 0;
        }

        if remain_usd == 0 || left == 0 {
            continue;
        }
        let returned = if remain_usd >= value {
            remain_usd -= value;
            left
        } else {
            let partial = tool.from_usd(&asset, remain_usd)?.min(left);
            remain_usd = 0;
            partial
        };
        if returned > 0 {
            split.remain.insert(asset, returned);
        }
    }

    if liquidate_usd > 0 || remain_usd > 0 {
        return Err(PortalError::CollateralExhausted {
            usd_left: liquidate_usd + remain_usd,
        });
    }
    Ok(split)
}

/// Collateral released from the pool for `redeem_amount` public tokens,
/// PRV keyed by [`PRV_ID`].
///
/// The unlocked USD value is `redeem_amount * pool_usd / pub_token_amount`
/// and is spread over the pool's assets in proportion to their value.
pub fn compute_pool_redemption(
    tool: &ExchangeRateTool<'_>,
    ptoken: &str,
    pool: &LiquidationPoolDetail,
    redeem_amount: Amount,
) -> Result<BTreeMap<String, Amount>, PortalError> {
    if pool.pub_token_amount == 0 {
        return Err(PortalError::LiquidationPoolEmpty(ptoken.to_string()));
    }
    if redeem_amount > pool.pub_token_amount {
        return Err(PortalError::NotEnoughPublicToken {
            token: ptoken.to_string(),
            needed: redeem_amount,
            available: pool.pub_token_amount,
        });
    }

    let mut assets = pool.token_collaterals_amount.clone();
    if pool.collateral_amount > 0 {
        assets.insert(PRV_ID.to_string(), pool.collateral_amount);
    }
    let pool_usd = tool.total_usd(&assets)?;
    if pool_usd == 0 {
        return Err(PortalError::LiquidationPoolEmpty(ptoken.to_string()));
    }
    let unlocked_usd = mul_div(
        redeem_amount as u128,
        pool_usd,
        pool.pub_token_amount as u128,
    )?;

    let mut released = BTreeMap::new();
    for (asset, amount) in collateral_walk_order(&assets) {
        let part = to_amount(mul_div(amount as u128, unlocked_usd, pool_usd)?)?;
        if part > 0 {
            released.insert(asset, part.min(amount));
        }
    }
    Ok(released)
}
