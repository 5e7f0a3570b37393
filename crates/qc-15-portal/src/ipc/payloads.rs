//! IPC Payloads for the Portal
//!
//! Action metadata submitted by users and custodians, and the content of
//! the instructions the engine emits.

use crate::domain::{
    Amount, ExchangeRateInfo, MatchingPortingCustodianDetail, MatchingRedeemCustodianDetail,
    RedeemRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================
// INCOMING ACTIONS
// ============================================================

/// Custodian deposits collateral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianDepositAction {
    /// Custodian address
    pub incognito_address: String,
    /// External addresses per portal token
    #[serde(default)]
    pub remote_addresses: BTreeMap<String, String>,
    /// Collateral asset
    pub collateral_token_id: String,
    /// Deposited amount
    pub deposit_amount: Amount,
    /// External transaction carrying a token deposit
    #[serde(default)]
    pub external_tx_id: String,
    /// Proof of the external deposit
    #[serde(default)]
    pub proof: String,
}

/// Custodian withdraws free collateral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianWithdrawAction {
    /// Custodian address
    pub incognito_address: String,
    /// Collateral asset
    pub collateral_token_id: String,
    /// Amount to withdraw
    pub amount: Amount,
    /// External receiver for token collateral
    #[serde(default)]
    pub external_address: String,
}

/// User requests a porting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortingRequestAction {
    /// Porting ID chosen by the user
    pub unique_register_id: String,
    /// Requester address
    pub incognito_address: String,
    /// Portal token
    pub token_id: String,
    /// pTokens requested
    pub register_amount: Amount,
    /// Fee paid in PRV
    pub porting_fee: Amount,
}

/// User proves delivery and asks for pTokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPTokenAction {
    /// Porting ID
    pub unique_porting_id: String,
    /// Portal token
    pub token_id: String,
    /// Requester address
    pub incognito_address: String,
    /// Amount claimed
    pub porting_amount: Amount,
    /// External-chain proof
    pub porting_proof: String,
}

/// Exchange rate submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRatesAction {
    /// Submitter
    pub sender_address: String,
    /// Rates
    pub rates: Vec<ExchangeRateInfo>,
}

/// User requests a redeem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequestAction {
    /// Redeem ID chosen by the user
    pub unique_redeem_id: String,
    /// Portal token
    pub token_id: String,
    /// Amount burned
    pub redeem_amount: Amount,
    /// Redeemer address
    pub redeemer_address: String,
    /// External address receiving public tokens
    pub remote_address: String,
    /// External address receiving collateral on liquidation
    #[serde(default)]
    pub redeemer_external_address: String,
    /// Fee paid in PRV
    pub redeem_fee: Amount,
}

/// Custodian volunteers for a waiting redeem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqMatchingRedeemAction {
    /// Custodian address
    pub custodian_address: String,
    /// Redeem ID
    pub redeem_id: String,
}

/// Custodian proves return of public tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUnlockCollateralAction {
    /// Redeem ID
    pub unique_redeem_id: String,
    /// Portal token
    pub token_id: String,
    /// Custodian address
    pub custodian_address: String,
    /// Amount returned
    pub redeem_amount: Amount,
    /// External-chain proof
    pub redeem_proof: String,
}

/// User redeems against the liquidation pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemFromPoolAction {
    /// Portal token
    pub token_id: String,
    /// Amount burned
    pub redeem_amount: Amount,
    /// Redeemer address
    pub redeemer_address: String,
    /// External address receiving token collateral
    #[serde(default)]
    pub redeemer_external_address: String,
}

/// Custodian tops up collateral for a portal token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianTopupAction {
    /// Custodian address
    pub incognito_address: String,
    /// Portal token
    pub ptoken_id: String,
    /// Collateral asset
    pub collateral_token_id: String,
    /// Freshly deposited amount
    #[serde(default)]
    pub deposit_amount: Amount,
    /// Amount drawn from free collateral
    #[serde(default)]
    pub free_collateral_amount: Amount,
    /// External transaction carrying a token deposit
    #[serde(default)]
    pub external_tx_id: String,
    /// Proof of the external deposit
    #[serde(default)]
    pub proof: String,
}

/// Custodian tops up collateral for a waiting porting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupWaitingPortingAction {
    /// Waiting porting ID
    pub porting_id: String,
    /// Top-up details
    #[serde(flatten)]
    pub topup: CustodianTopupAction,
}

/// Custodian unlocks collateral above the over-rate threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockOverRateAction {
    /// Custodian address
    pub custodian_address: String,
    /// Portal token
    pub token_id: String,
}

/// Custodian withdraws accumulated rewards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRewardAction {
    /// Custodian address
    pub custodian_address: String,
    /// Reward token
    pub token_id: String,
}

// ============================================================
// OUTGOING CONTENT
// ============================================================

/// Extra fields attached to an action result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Custodians picked for a porting
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub porting_custodians: Vec<MatchingPortingCustodianDetail>,
    /// Amount matched to a volunteering custodian
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_amount: Option<Amount>,
    /// Whether the match completed the redeem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_fully_matched: Option<bool>,
    /// Collateral released per asset
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub released_collaterals: BTreeMap<String, Amount>,
    /// Amount added to locked by a top-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topup_amount: Option<Amount>,
    /// Reward paid out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_amount: Option<Amount>,
    /// Why the action was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Content of an action result: the submitted action plus its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContent<T> {
    /// Shard transaction ID
    pub tx_req_id: String,
    /// Submitted action
    #[serde(flatten)]
    pub action: T,
    /// Outcome
    #[serde(default)]
    pub outcome: ActionOutcome,
}

/// A waiting porting expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredPortingContent {
    /// Porting ID
    pub unique_porting_id: String,
    /// Portal token
    pub token_id: String,
    /// Requester address
    pub porter_address: String,
    /// Requested amount
    pub amount: Amount,
    /// Custodians whose locks were released
    pub custodians: Vec<MatchingPortingCustodianDetail>,
    /// Porting fee, not refunded
    pub porting_fee: Amount,
}

/// A custodian failed to return public tokens in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidateCustodianContent {
    /// Redeem ID
    pub unique_redeem_id: String,
    /// Portal token
    pub token_id: String,
    /// Redeemer receiving the seized collateral
    pub redeemer_address: String,
    /// External address receiving token collateral
    pub redeemer_external_address: String,
    /// Liquidated custodian
    pub custodian_address: String,
    /// Public tokens the custodian owed
    pub liquidated_pub_token_amount: Amount,
    /// Collateral paid to the redeemer per asset
    pub liquidated_collaterals: BTreeMap<String, Amount>,
    /// Collateral returned to the custodian per asset
    pub remain_unlock_collaterals: BTreeMap<String, Amount>,
}

/// One portal token position liquidated by rates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationByRatesDetail {
    /// Collateral ratio in percent
    pub ratio: u128,
    /// Public tokens moved into the pool
    pub liquidated_pub_token_amount: Amount,
    /// Collateral moved into the pool per asset
    pub liquidated_collaterals: BTreeMap<String, Amount>,
    /// Collateral returned to free per asset
    pub remain_unlock_collaterals: BTreeMap<String, Amount>,
}

/// A custodian's positions liquidated by rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidateByRatesContent {
    /// Custodian address
    pub custodian_address: String,
    /// Liquidation per portal token
    pub details: BTreeMap<String, LiquidationByRatesDetail>,
}

/// A waiting redeem cancelled and refunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledRedeemContent {
    /// The cancelled redeem
    pub redeem: RedeemRequest,
    /// Cause
    pub reason: String,
}

/// Custodians assigned to a timed-out waiting redeem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickMoreCustodianContent {
    /// Redeem ID
    pub unique_redeem_id: String,
    /// Portal token
    pub token_id: String,
    /// Newly assigned custodians
    pub custodians: Vec<MatchingRedeemCustodianDetail>,
}

/// Rewards distributed at one beacon height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardContent {
    /// Beacon height
    pub beacon_height: u64,
    /// Reward per custodian then token
    pub rewards: BTreeMap<String, BTreeMap<String, Amount>>,
}

/// Reward totals at one beacon height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalRewardContent {
    /// Beacon height
    pub beacon_height: u64,
    /// Total per token
    pub rewards: BTreeMap<String, Amount>,
}
