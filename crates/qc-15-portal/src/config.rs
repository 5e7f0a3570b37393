//! Configuration for the Portal subsystem

use crate::domain::{
    PortalError, DAI_ID, ETH_ID, PORTAL_BNB_ID, PORTAL_BTC_ID, PRV_ID, USDT_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Decimals of the native coin.
pub const PRV_DECIMALS: u32 = 9;

/// Protocol parameters, consumed read-only by every processor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortalParams {
    /// Over-collateralization percent required to port
    pub min_percent_locked_collateral: u64,
    /// Liquidation threshold percent
    pub tp120: u64,
    /// Warning threshold percent
    pub tp130: u64,
    /// Porting fee as percent of the ported value in PRV
    pub min_percent_porting_fee: f64,
    /// Redeem fee as percent of the redeemed value in PRV
    pub min_percent_redeem_fee: f64,
    /// Fee floor in PRV base units
    pub min_portal_fee: u64,
    /// Percent of the liquidated public token value seized as collateral
    pub max_percent_liquidated_collateral_amount: u64,
    /// Over-rate unlock threshold, in tenths (25 = 250%)
    pub min_unlock_over_rate_collaterals: u64,
    /// Supported token collateral and its decimals
    pub supported_collateral_tokens: BTreeMap<String, u32>,
    /// Portal tokens and their decimals
    pub portal_tokens: BTreeMap<String, u32>,
    /// Waiting porting lifetime (seconds)
    pub timeout_waiting_porting_request_secs: u64,
    /// Waiting redeem lifetime before the protocol picks custodians (seconds)
    pub timeout_waiting_redeem_request_secs: u64,
    /// Time a custodian has to return public tokens (seconds)
    pub timeout_custodian_return_pub_token_secs: u64,
    /// Beacon block interval (seconds)
    pub beacon_block_interval_secs: u64,
    /// Beacon heights per reward epoch
    pub epoch_length: u64,
    /// PRV distributed to custodians each epoch
    pub reward_per_epoch: u64,
}

impl Default for PortalParams {
    fn default() -> Self {
        let supported_collateral_tokens = BTreeMap::from([
            (ETH_ID.to_string(), 9),
            (USDT_ID.to_string(), 6),
            (DAI_ID.to_string(), 9),
        ]);
        let portal_tokens = BTreeMap::from([
            (PORTAL_BTC_ID.to_string(), 9),
            (PORTAL_BNB_ID.to_string(), 9),
        ]);
        Self {
            min_percent_locked_collateral: 150,
            tp120: 120,
            tp130: 130,
            min_percent_porting_fee: 0.01,
            min_percent_redeem_fee: 0.01,
            min_portal_fee: 100,
            max_percent_liquidated_collateral_amount: 105,
            min_unlock_over_rate_collaterals: 25,
            supported_collateral_tokens,
            portal_tokens,
            timeout_waiting_porting_request_secs: 24 * 60 * 60,
            timeout_waiting_redeem_request_secs: 15 * 60,
            timeout_custodian_return_pub_token_secs: 24 * 60 * 60,
            beacon_block_interval_secs: 40,
            epoch_length: 350,
            reward_per_epoch: 0,
        }
    }
}

impl PortalParams {
    /// Check threshold ordering and registry consistency.
    pub fn validate(&self) -> Result<(), PortalError> {
        if self.tp120 >= self.tp130 {
            return Err(PortalError::InvalidParams(format!(
                "tp120 {} must be below tp130 {}",
                self.tp120, self.tp130
            )));
        }
        if self.min_percent_locked_collateral <= self.tp130 {
            return Err(PortalError::InvalidParams(format!(
                "min_percent_locked_collateral {} must exceed tp130 {}",
                self.min_percent_locked_collateral, self.tp130
            )));
        }
        if self.beacon_block_interval_secs == 0 || self.epoch_length == 0 {
            return Err(PortalError::InvalidParams(
                "block interval and epoch length must be non-zero".into(),
            ));
        }
        if !(self.min_percent_porting_fee >= 0.0 && self.min_percent_redeem_fee >= 0.0) {
            return Err(PortalError::InvalidParams("fee percents must be non-negative".into()));
        }
        for asset in self.portal_tokens.keys() {
            if self.supported_collateral_tokens.contains_key(asset) || asset == PRV_ID {
                return Err(PortalError::InvalidParams(format!(
                    "{asset} registered both as portal token and collateral"
                )));
            }
        }
        Ok(())
    }

    /// Decimals of any registered asset.
    pub fn decimals_of(&self, asset: &str) -> Option<u32> {
        if asset == PRV_ID {
            return Some(PRV_DECIMALS);
        }
        self.portal_tokens
            .get(asset)
            .or_else(|| self.supported_collateral_tokens.get(asset))
            .copied()
    }

    /// Whether the asset is a portal token.
    pub fn is_portal_token(&self, asset: &str) -> bool {
        self.portal_tokens.contains_key(asset)
    }

    /// Whether the asset may be deposited as collateral.
    pub fn is_supported_collateral(&self, asset: &str) -> bool {
        asset == PRV_ID || self.supported_collateral_tokens.contains_key(asset)
    }

    /// Whether the asset may appear in an exchange-rate submission.
    pub fn is_rated_asset(&self, asset: &str) -> bool {
        self.decimals_of(asset).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = PortalParams::default();
        assert_eq!(params.min_percent_locked_collateral, 150);
        assert_eq!(params.tp120, 120);
        assert_eq!(params.tp130, 130);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_decimals_registry() {
        let params = PortalParams::default();
        assert_eq!(params.decimals_of(PRV_ID), Some(9));
        assert_eq!(params.decimals_of(USDT_ID), Some(6));
        assert_eq!(params.decimals_of(PORTAL_BTC_ID), Some(9));
        assert_eq!(params.decimals_of("unknown"), None);
        assert!(params.is_supported_collateral(PRV_ID));
        assert!(!params.is_supported_collateral(PORTAL_BTC_ID));
        assert!(params.is_portal_token(PORTAL_BNB_ID));
    }

    #[test]
    fn test_invalid_thresholds() {
        let params = PortalParams {
            tp120: 130,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_params_json_round_trip() {
        let params = PortalParams::default();
        let json = serde_json::to_string(&params).unwrap();
        let back: PortalParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.portal_tokens, params.portal_tokens);
        assert_eq!(back.min_portal_fee, params.min_portal_fee);
    }
}
