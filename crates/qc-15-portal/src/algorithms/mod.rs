//! # Algorithms Module
//!
//! Rate conversion, custodian bookkeeping, matching and liquidation math.

pub mod exchange_rate;
pub mod ledger;
pub mod liquidation;
pub mod median;
pub mod porting_match;
pub mod redeem_match;
pub mod rewards;

pub use exchange_rate::{down_percent, mul_div, up_percent, ExchangeRateTool, USD_PRECISION};
pub use ledger::{collateral_walk_order, drain_by_usd, UsdDrain};
pub use liquidation::{
    collateral_ratio, compute_pool_redemption, split_liquidated_collateral, unlock_amount_usd,
    LiquidationSplit, LiquidationSplitParams,
};
pub use median::{median_rate, pick_final_exchange_rates};
pub use porting_match::{pick_custodians_for_porting, PortingPickParams};
pub use redeem_match::{match_custodian_to_waiting_redeem, pick_custodians_for_redeem};
pub use rewards::{split_epoch_reward, split_fee_by_amount};
