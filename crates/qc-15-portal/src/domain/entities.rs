//! # Domain Entities
//!
//! Custodians, porting and redeem requests, rates, pools and reward
//! accumulators. Every map is a `BTreeMap` so iteration order is the same
//! on every node.

use super::value_objects::{Amount, InstructionKind, InstructionStatus, UsdAmount, PRV_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One custodian's collateral position.
///
/// PRV collateral and token collateral are tracked in separate fields;
/// `locked_collaterals` and `locked_token_collaterals` are keyed by portal
/// token first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianState {
    /// Incognito address of the custodian.
    pub incognito_address: String,
    /// Total PRV collateral.
    pub total_collateral: Amount,
    /// Free PRV collateral.
    pub free_collateral: Amount,
    /// Public tokens held on behalf of users, per portal token.
    pub holding_public_tokens: BTreeMap<String, Amount>,
    /// Locked PRV, per portal token.
    pub locked_collaterals: BTreeMap<String, Amount>,
    /// External chain address, per portal token.
    pub remote_addresses: BTreeMap<String, String>,
    /// Accumulated rewards, per token.
    pub reward_amount: BTreeMap<String, Amount>,
    /// Total token collateral, per collateral asset.
    pub total_token_collaterals: BTreeMap<String, Amount>,
    /// Free token collateral, per collateral asset.
    pub free_token_collaterals: BTreeMap<String, Amount>,
    /// Locked token collateral, per portal token then collateral asset.
    pub locked_token_collaterals: BTreeMap<String, BTreeMap<String, Amount>>,
}

impl CustodianState {
    /// Create an empty custodian.
    pub fn new(incognito_address: impl Into<String>) -> Self {
        Self {
            incognito_address: incognito_address.into(),
            ..Default::default()
        }
    }

    /// Free balance of a collateral asset.
    pub fn free_of(&self, asset: &str) -> Amount {
        if asset == PRV_ID {
            self.free_collateral
        } else {
            self.free_token_collaterals.get(asset).copied().unwrap_or(0)
        }
    }

    /// Total balance of a collateral asset.
    pub fn total_of(&self, asset: &str) -> Amount {
        if asset == PRV_ID {
            self.total_collateral
        } else {
            self.total_token_collaterals.get(asset).copied().unwrap_or(0)
        }
    }

    /// Locked balance of a collateral asset for a portal token.
    pub fn locked_of(&self, ptoken: &str, asset: &str) -> Amount {
        if asset == PRV_ID {
            self.locked_collaterals.get(ptoken).copied().unwrap_or(0)
        } else {
            self.locked_token_collaterals
                .get(ptoken)
                .and_then(|m| m.get(asset))
                .copied()
                .unwrap_or(0)
        }
    }

    /// Locked collateral for a portal token, PRV keyed by [`PRV_ID`].
    pub fn locked_assets(&self, ptoken: &str) -> BTreeMap<String, Amount> {
        let mut assets = BTreeMap::new();
        if let Some(prv) = self.locked_collaterals.get(ptoken) {
            assets.insert(PRV_ID.to_string(), *prv);
        }
        if let Some(tokens) = self.locked_token_collaterals.get(ptoken) {
            for (asset, amount) in tokens {
                assets.insert(asset.clone(), *amount);
            }
        }
        assets
    }

    /// Holding balance for a portal token.
    pub fn holding_of(&self, ptoken: &str) -> Amount {
        self.holding_public_tokens.get(ptoken).copied().unwrap_or(0)
    }

    /// Whether every collateral balance is zero.
    pub fn has_no_collateral(&self) -> bool {
        self.total_collateral == 0 && self.total_token_collaterals.values().all(|v| *v == 0)
    }

    /// Portal tokens with any locked collateral.
    pub fn locked_ptokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .locked_collaterals
            .keys()
            .chain(self.locked_token_collaterals.keys())
            .cloned()
            .collect();
        tokens.sort();
        tokens.dedup();
        tokens
    }
}

/// A custodian's part in a porting request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingPortingCustodianDetail {
    /// Custodian address.
    pub incognito_address: String,
    /// Custodian's external address for the portal token.
    pub remote_address: String,
    /// pTokens allotted to this custodian.
    pub amount: Amount,
    /// PRV locked for this porting.
    pub locked_amount_collateral: Amount,
    /// Token collateral locked for this porting.
    pub locked_token_collaterals: BTreeMap<String, Amount>,
}

impl MatchingPortingCustodianDetail {
    /// Locked collateral, PRV keyed by [`PRV_ID`].
    pub fn locked_assets(&self) -> BTreeMap<String, Amount> {
        let mut assets = self.locked_token_collaterals.clone();
        if self.locked_amount_collateral > 0 {
            assets.insert(PRV_ID.to_string(), self.locked_amount_collateral);
        }
        assets
    }
}

/// Open porting request awaiting the user's proof.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingPortingRequest {
    /// Unique porting ID.
    pub unique_porting_id: String,
    /// Transaction that submitted the request.
    pub tx_req_id: String,
    /// Portal token.
    pub token_id: String,
    /// Requester address.
    pub porter_address: String,
    /// Requested pToken amount.
    pub amount: Amount,
    /// Matched custodians.
    pub custodians: Vec<MatchingPortingCustodianDetail>,
    /// Porting fee in PRV.
    pub porting_fee: Amount,
    /// Beacon height the request became waiting.
    pub beacon_height: u64,
    /// Shard of the requester.
    pub shard_id: u8,
}

/// A custodian's part in a redeem request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRedeemCustodianDetail {
    /// Custodian address.
    pub incognito_address: String,
    /// Custodian's external address for the portal token.
    pub remote_address: String,
    /// Public tokens the custodian must return.
    pub amount: Amount,
}

/// Redeem request, waiting or matched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    /// Unique redeem ID.
    pub unique_redeem_id: String,
    /// Transaction that submitted the request.
    pub tx_req_id: String,
    /// Portal token.
    pub token_id: String,
    /// Redeemer address.
    pub redeemer_address: String,
    /// External address that receives the public tokens.
    pub redeemer_remote_address: String,
    /// External address for collateral returned on liquidation.
    pub redeemer_external_address: String,
    /// Requested amount.
    pub redeem_amount: Amount,
    /// Matched custodians.
    pub custodians: Vec<MatchingRedeemCustodianDetail>,
    /// Redeem fee in PRV.
    pub redeem_fee: Amount,
    /// Beacon height the request was accepted.
    pub beacon_height: u64,
    /// Shard of the redeemer.
    pub shard_id: u8,
}

impl RedeemRequest {
    /// Sum of matched custodian amounts.
    pub fn matched_amount(&self) -> Amount {
        self.custodians.iter().map(|c| c.amount).sum()
    }

    /// Amount still needed.
    pub fn unmatched_amount(&self) -> Amount {
        self.redeem_amount.saturating_sub(self.matched_amount())
    }

    /// Amount matched to a given custodian.
    pub fn share_of(&self, custodian: &str) -> Amount {
        self.custodians
            .iter()
            .filter(|c| c.incognito_address == custodian)
            .map(|c| c.amount)
            .sum()
    }
}

/// Median exchange rates for one beacon height.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalExchangeRates {
    /// Price per whole unit, per asset.
    pub rates: BTreeMap<String, u64>,
}

/// One rate in an exchange-rate submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRateInfo {
    /// Asset.
    pub token_id: String,
    /// Price per whole unit.
    pub rate: u64,
}

/// Accepted exchange-rate submission.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRatesRequest {
    /// Submitter.
    pub sender_address: String,
    /// Submitted rates.
    pub rates: Vec<ExchangeRateInfo>,
}

/// Seized collateral for one portal token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationPoolDetail {
    /// Seized PRV.
    pub collateral_amount: Amount,
    /// Public tokens the seized collateral backs.
    pub pub_token_amount: Amount,
    /// Seized token collateral.
    pub token_collaterals_amount: BTreeMap<String, Amount>,
}

/// Liquidation pool across portal tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationPool {
    /// Pool per portal token.
    pub rates: BTreeMap<String, LiquidationPoolDetail>,
}

/// Locked collateral valuation for reward distribution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedCollateralState {
    /// Sum of all details.
    pub total_locked_collateral_for_rewards: UsdAmount,
    /// Valuation per custodian.
    pub locked_collateral_detail: BTreeMap<String, UsdAmount>,
}

/// Status record written for external query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Instruction kind that produced the record.
    pub kind: InstructionKind,
    /// Request or transaction ID.
    pub id: String,
    /// Outcome.
    pub status: InstructionStatus,
    /// JSON content of the result instruction.
    pub content: String,
}

/// Bridge token accounting for one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTokenDelta {
    /// Amount minted.
    pub count_up_amount: Amount,
    /// Amount burned.
    pub deduct_amount: Amount,
}

impl BridgeTokenDelta {
    /// Net change as a sign and magnitude.
    pub fn net(&self) -> (char, Amount) {
        if self.count_up_amount >= self.deduct_amount {
            ('+', self.count_up_amount - self.deduct_amount)
        } else {
            ('-', self.deduct_amount - self.count_up_amount)
        }
    }
}
