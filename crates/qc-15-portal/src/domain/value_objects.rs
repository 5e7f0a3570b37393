//! # Domain Value Objects
//!
//! Asset identifiers, instruction kinds and statuses, collateral tiers.

use serde::{Deserialize, Serialize};

/// Token amount in base units.
pub type Amount = u64;

/// USD value at pivot precision.
pub type UsdAmount = u128;

/// Native coin, always the first collateral asset considered.
pub const PRV_ID: &str = "0000000000000000000000000000000000000000000000000000000000000004";

/// Portal token backed by BTC.
pub const PORTAL_BTC_ID: &str = "b832e5d3b1f01a4f0623f7fe91d6673461e1f5d37d91fe78c5c2e6183ff39696";

/// Portal token backed by BNB.
pub const PORTAL_BNB_ID: &str = "b2655152784e8639fa19521a7035f331eea1f1e911b2f3200a507ebb4554387b";

/// ETH collateral (external contract address of the native coin).
pub const ETH_ID: &str = "0x0000000000000000000000000000000000000000";

/// USDT collateral.
pub const USDT_ID: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";

/// DAI collateral.
pub const DAI_ID: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";

/// Instruction kinds carried in the first field of an instruction record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum InstructionKind {
    /// User proves delivery of the external asset and receives pTokens.
    RequestPToken = 202,
    /// Exchange rate submission.
    ExchangeRates = 205,
    /// Waiting porting expired.
    ExpiredWaitingPorting = 217,
    /// Per-custodian reward distribution.
    Reward = 218,
    /// Custodian withdraws accumulated rewards.
    RequestWithdrawReward = 219,
    /// Total reward distributed this block.
    TotalCustodianReward = 225,
    /// Custodian volunteers for a waiting redeem.
    ReqMatchingRedeem = 228,
    /// Protocol picks custodians for a timed-out waiting redeem.
    PickMoreCustodianForRedeem = 229,
    /// Custodian deposits collateral.
    CustodianDeposit = 242,
    /// Custodian withdraws free collateral.
    CustodianWithdraw = 244,
    /// Custodian unlocks collateral after returning public tokens.
    RequestUnlockCollateral = 247,
    /// Custodian failed to return public tokens in time.
    LiquidateCustodian = 248,
    /// Custodian position fell below TP120.
    LiquidateByRates = 249,
    /// User redeems directly against the liquidation pool.
    RedeemFromLiquidationPool = 250,
    /// Custodian tops up collateral for a portal token.
    CustodianTopup = 252,
    /// Custodian tops up collateral for a waiting porting.
    TopupWaitingPorting = 254,
    /// User requests a porting.
    PortingRequest = 256,
    /// User requests a redeem.
    RedeemRequest = 257,
    /// Custodian unlocks collateral above the over-rate threshold.
    UnlockOverRateCollaterals = 259,
    /// Waiting redeem cancelled by a liquidation.
    LiquidationCancelledRedeem = 260,
}

impl InstructionKind {
    /// Every kind, in metadata type order.
    pub const ALL: [InstructionKind; 20] = [
        Self::RequestPToken,
        Self::ExchangeRates,
        Self::ExpiredWaitingPorting,
        Self::Reward,
        Self::RequestWithdrawReward,
        Self::TotalCustodianReward,
        Self::ReqMatchingRedeem,
        Self::PickMoreCustodianForRedeem,
        Self::CustodianDeposit,
        Self::CustodianWithdraw,
        Self::RequestUnlockCollateral,
        Self::LiquidateCustodian,
        Self::LiquidateByRates,
        Self::RedeemFromLiquidationPool,
        Self::CustodianTopup,
        Self::TopupWaitingPorting,
        Self::PortingRequest,
        Self::RedeemRequest,
        Self::UnlockOverRateCollaterals,
        Self::LiquidationCancelledRedeem,
    ];

    /// Metadata type ID.
    pub fn type_id(self) -> u16 {
        self as u16
    }

    /// Look up a kind by metadata type ID.
    pub fn from_type_id(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.type_id() == id)
    }

    /// Whether the kind is produced by the engine itself rather than
    /// submitted as a user or custodian action.
    pub fn is_automatic(self) -> bool {
        matches!(
            self,
            Self::ExpiredWaitingPorting
                | Self::Reward
                | Self::TotalCustodianReward
                | Self::PickMoreCustodianForRedeem
                | Self::LiquidateCustodian
                | Self::LiquidateByRates
                | Self::LiquidationCancelledRedeem
        )
    }
}

/// Status field of an instruction record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionStatus {
    /// Submitted action awaiting processing.
    Request,
    /// Action applied.
    Accepted,
    /// Action refused; state untouched.
    Rejected,
    /// Funds returned to the requester.
    Refund,
    /// Request expired.
    Expired,
    /// Automatic transition applied.
    Success,
    /// Automatic transition could not be applied.
    Failed,
}

impl InstructionStatus {
    /// Wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Refund => "refund",
            Self::Expired => "expired",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parse a wire string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Self::Request),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "refund" => Some(Self::Refund),
            "expired" => Some(Self::Expired),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Collateralization tier of a (custodian, portal token) position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollateralTier {
    /// Ratio above TP130.
    #[default]
    Healthy,
    /// Ratio in (TP120, TP130].
    Warning,
    /// Ratio at or below TP120.
    Liquidate,
}

impl CollateralTier {
    /// Classify a ratio (percent) against the two thresholds.
    pub fn classify(ratio: u128, tp120: u64, tp130: u64) -> Self {
        if ratio <= tp120 as u128 {
            Self::Liquidate
        } else if ratio <= tp130 as u128 {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}
