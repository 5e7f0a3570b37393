//! # Domain Errors
//!
//! Error types for the Portal subsystem.
//!
//! Two families live in one enum: business failures that turn into a
//! `rejected` instruction, and state violations that abort the whole block.
//! [`PortalError::is_state_violation`] tells them apart.

use thiserror::Error;

/// Portal error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortalError {
    /// Asset is not in the decimals registry.
    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    /// No final exchange rates have been recorded yet.
    #[error("Exchange rates are not available")]
    ExchangeRatesMissing,

    /// Asset has no entry in the final exchange rates.
    #[error("No exchange rate for asset {0}")]
    RateNotFound(String),

    /// Asset price is zero.
    #[error("Zero price for asset {0}")]
    ZeroPrice(String),

    /// Integer overflow or division by zero in amount arithmetic.
    #[error("Arithmetic overflow in {0}")]
    ArithmeticOverflow(&'static str),

    /// Collateral balance too small for the requested change.
    #[error("Insufficient collateral {asset}: needed {needed}, available {available}")]
    InsufficientCollateral {
        /// Collateral asset
        asset: String,
        /// Amount needed
        needed: u64,
        /// Amount available
        available: u64,
    },

    /// Holding public token balance too small.
    #[error("Insufficient holding {token}: needed {needed}, available {available}")]
    InsufficientHolding {
        /// Portal token
        token: String,
        /// Amount needed
        needed: u64,
        /// Amount available
        available: u64,
    },

    /// Custodian address not in the pool.
    #[error("Custodian not found: {0}")]
    CustodianNotFound(String),

    /// Custodian pool has no eligible members.
    #[error("Custodian pool is empty")]
    CustodianPoolEmpty,

    /// Custodian has no remote address for a portal token.
    #[error("Custodian {custodian} has no remote address for {token}")]
    NoRemoteAddress {
        /// Custodian address
        custodian: String,
        /// Portal token
        token: String,
    },

    /// Free collateral across eligible custodians does not reach the target.
    #[error("Not enough custodians: target {target_usd}, available {available_usd}")]
    NotEnoughCustodians {
        /// USD value to cover
        target_usd: u128,
        /// USD value offered
        available_usd: u128,
    },

    /// Holdings across custodians do not cover a redeem.
    #[error("Not enough public token {token}: needed {needed}, available {available}")]
    NotEnoughPublicToken {
        /// Portal token
        token: String,
        /// Amount needed
        needed: u64,
        /// Amount available
        available: u64,
    },

    /// Waiting porting request not found.
    #[error("Waiting porting request not found: {0}")]
    PortingNotFound(String),

    /// Redeem request not found.
    #[error("Redeem request not found: {0}")]
    RedeemNotFound(String),

    /// Locked collateral ran out before the USD value was covered.
    #[error("Locked collateral exhausted with {usd_left} USD left")]
    CollateralExhausted {
        /// USD value still uncovered
        usd_left: u128,
    },

    /// Custodian holds nothing for the token.
    #[error("Total holding is zero for {0}")]
    ZeroTotalHolding(String),

    /// Computed unlock amount is zero.
    #[error("Unlock amount is zero")]
    ZeroUnlockAmount,

    /// Liquidation pool has nothing for the token.
    #[error("Liquidation pool is empty for {0}")]
    LiquidationPoolEmpty(String),

    /// Protocol parameters failed validation.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Instruction record or payload could not be decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// State store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Conservation or bookkeeping invariant broken.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),
}

impl PortalError {
    /// Whether the error signals corrupted state rather than a bad request.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            PortalError::ArithmeticOverflow(_)
                | PortalError::ZeroPrice(_)
                | PortalError::CollateralExhausted { .. }
                | PortalError::Store(_)
                | PortalError::ConsistencyViolation(_)
        )
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(err: serde_json::Error) -> Self {
        PortalError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PortalError::InsufficientCollateral {
            asset: "PRV".into(),
            needed: 10,
            available: 5,
        };
        assert!(err.to_string().contains("needed 10"));

        let err = PortalError::NotEnoughCustodians {
            target_usd: 750,
            available_usd: 500,
        };
        assert!(err.to_string().contains("target 750"));
    }

    #[test]
    fn test_state_violation_classification() {
        assert!(PortalError::ConsistencyViolation("x".into()).is_state_violation());
        assert!(PortalError::Store("io".into()).is_state_violation());
        assert!(!PortalError::CustodianPoolEmpty.is_state_violation());
        assert!(!PortalError::RedeemNotFound("r".into()).is_state_violation());
    }
}
