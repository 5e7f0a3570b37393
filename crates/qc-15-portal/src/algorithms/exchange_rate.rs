//! # Exchange Rate Tool
//!
//! Converts between any two registered assets through a USD pivot.
//!
//! A rate is the price of one whole unit (`10^decimals` base units). USD
//! values carry [`USD_PRECISION`] extra digits so that a round trip through
//! USD loses at most one base unit for every registered asset.

use crate::config::PortalParams;
use crate::domain::{Amount, FinalExchangeRates, PortalError, UsdAmount, PRV_ID};
use primitive_types::U256;
use std::collections::BTreeMap;

/// Extra precision carried by USD values.
pub const USD_PRECISION: u128 = 1_000_000_000;

/// `a * b / c` with a 256-bit intermediate.
pub fn mul_div(a: u128, b: u128, c: u128) -> Result<u128, PortalError> {
    if c == 0 {
        return Err(PortalError::ArithmeticOverflow("mul_div by zero"));
    }
    let product = U256::from(a)
        .checked_mul(U256::from(b))
        .ok_or(PortalError::ArithmeticOverflow("mul_div product"))?;
    let quotient = product / U256::from(c);
    if quotient > U256::from(u128::MAX) {
        return Err(PortalError::ArithmeticOverflow("mul_div quotient"));
    }
    Ok(quotient.as_u128())
}

/// Narrow to an [`Amount`].
pub fn to_amount(value: u128) -> Result<Amount, PortalError> {
    Amount::try_from(value).map_err(|_| PortalError::ArithmeticOverflow("amount narrowing"))
}

/// `amount * percent / 100`.
pub fn up_percent(amount: Amount, percent: u64) -> Result<Amount, PortalError> {
    to_amount(mul_div(amount as u128, percent as u128, 100)?)
}

/// `amount * 100 / percent`.
pub fn down_percent(amount: Amount, percent: u64) -> Result<Amount, PortalError> {
    to_amount(mul_div(amount as u128, 100, percent as u128)?)
}

/// Stateless converter over one set of final rates.
pub struct ExchangeRateTool<'a> {
    rates: &'a FinalExchangeRates,
    params: &'a PortalParams,
}

impl<'a> ExchangeRateTool<'a> {
    /// Build a tool over the given rates and decimals registry.
    pub fn new(rates: &'a FinalExchangeRates, params: &'a PortalParams) -> Self {
        Self { rates, params }
    }

    /// Build a tool, failing when rates have never been recorded.
    pub fn try_new(
        rates: Option<&'a FinalExchangeRates>,
        params: &'a PortalParams,
    ) -> Result<Self, PortalError> {
        rates
            .map(|rates| Self::new(rates, params))
            .ok_or(PortalError::ExchangeRatesMissing)
    }

    fn price_and_unit(&self, asset: &str) -> Result<(u128, u128), PortalError> {
        let decimals = self
            .params
            .decimals_of(asset)
            .ok_or_else(|| PortalError::UnknownAsset(asset.to_string()))?;
        let price = *self
            .rates
            .rates
            .get(asset)
            .ok_or_else(|| PortalError::RateNotFound(asset.to_string()))?;
        if price == 0 {
            return Err(PortalError::ZeroPrice(asset.to_string()));
        }
        let unit = 10u128
            .checked_pow(decimals)
            .ok_or(PortalError::ArithmeticOverflow("decimals"))?;
        Ok((price as u128, unit))
    }

    /// Value of `amount` base units in USD.
    pub fn to_usd(&self, asset: &str, amount: Amount) -> Result<UsdAmount, PortalError> {
        let (price, unit) = self.price_and_unit(asset)?;
        let scaled_price = price
            .checked_mul(USD_PRECISION)
            .ok_or(PortalError::ArithmeticOverflow("scaled price"))?;
        mul_div(amount as u128, scaled_price, unit)
    }

    /// Base units of `asset` worth `usd`.
    pub fn from_usd(&self, asset: &str, usd: UsdAmount) -> Result<Amount, PortalError> {
        let (price, unit) = self.price_and_unit(asset)?;
        let scaled_price = price
            .checked_mul(USD_PRECISION)
            .ok_or(PortalError::ArithmeticOverflow("scaled price"))?;
        to_amount(mul_div(usd, unit, scaled_price)?)
    }

    /// Convert between two assets.
    pub fn convert(&self, from: &str, to: &str, amount: Amount) -> Result<Amount, PortalError> {
        self.from_usd(to, self.to_usd(from, amount)?)
    }

    /// Sum of the USD values of a map of asset amounts.
    pub fn total_usd(&self, amounts: &BTreeMap<String, Amount>) -> Result<UsdAmount, PortalError> {
        amounts.iter().try_fold(0u128, |acc, (asset, amount)| {
            acc.checked_add(self.to_usd(asset, *amount)?)
                .ok_or(PortalError::ArithmeticOverflow("total usd"))
        })
    }

    /// Fee in PRV for moving `amount` of `token`.
    ///
    /// The percentage step runs in `f64` and rounds half away from zero;
    /// the result never drops below `min_fee`.
    pub fn portal_fee(
        &self,
        token: &str,
        amount: Amount,
        percent: f64,
        min_fee: Amount,
    ) -> Result<Amount, PortalError> {
        let value_in_prv = self.convert(token, PRV_ID, amount)?;
        let fee = (value_in_prv as f64 * percent / 100.0).round();
        let fee = if fee.is_finite() && fee >= 0.0 && fee < u64::MAX as f64 {
            fee as Amount
        } else {
            return Err(PortalError::ArithmeticOverflow("portal fee"));
        };
        Ok(fee.max(min_fee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PORTAL_BNB_ID, PORTAL_BTC_ID, USDT_ID};
    use proptest::prelude::*;

    fn rates() -> FinalExchangeRates {
        FinalExchangeRates {
            rates: BTreeMap::from([
                (PRV_ID.to_string(), 1_000_000),
                (PORTAL_BTC_ID.to_string(), 10_000_000_000),
                (PORTAL_BNB_ID.to_string(), 40_000_000),
                (USDT_ID.to_string(), 1_000_000),
            ]),
        }
    }

    #[test]
    fn test_convert_btc_to_prv() {
        let params = PortalParams::default();
        let rates = rates();
        let tool = ExchangeRateTool::new(&rates, &params);
        // 1 pBTC = 10,000 PRV at these rates
        assert_eq!(
            tool.convert(PORTAL_BTC_ID, PRV_ID, 1_000_000_000).unwrap(),
            10_000_000_000_000
        );
    }

    #[test]
    fn test_convert_across_decimals() {
        let params = PortalParams::default();
        let rates = rates();
        let tool = ExchangeRateTool::new(&rates, &params);
        // 1 USDT (6 decimals) == 1 PRV (9 decimals)
        assert_eq!(tool.convert(USDT_ID, PRV_ID, 1_000_000).unwrap(), 1_000_000_000);
    }

    #[test]
    fn test_unknown_and_missing_assets() {
        let params = PortalParams::default();
        let mut rates = rates();
        let tool = ExchangeRateTool::new(&rates, &params);
        assert_eq!(
            tool.to_usd("nope", 1).unwrap_err(),
            PortalError::UnknownAsset("nope".into())
        );
        assert!(matches!(
            tool.to_usd(crate::domain::DAI_ID, 1),
            Err(PortalError::RateNotFound(_))
        ));

        rates.rates.insert(PRV_ID.to_string(), 0);
        let tool = ExchangeRateTool::new(&rates, &params);
        assert!(matches!(tool.to_usd(PRV_ID, 1), Err(PortalError::ZeroPrice(_))));
    }

    #[test]
    fn test_missing_rates_state() {
        let params = PortalParams::default();
        assert!(matches!(
            ExchangeRateTool::try_new(None, &params),
            Err(PortalError::ExchangeRatesMissing)
        ));
    }

    #[test]
    fn test_portal_fee_floor_and_rounding() {
        let params = PortalParams::default();
        let rates = rates();
        let tool = ExchangeRateTool::new(&rates, &params);
        // tiny amount hits the floor
        assert_eq!(tool.portal_fee(PORTAL_BTC_ID, 1, 0.01, 100).unwrap(), 100);
        // 1 pBTC -> 10^13 PRV units, 0.01% = 10^9
        assert_eq!(
            tool.portal_fee(PORTAL_BTC_ID, 1_000_000_000, 0.01, 100).unwrap(),
            1_000_000_000
        );
        // 25 PRV units at 10% is 2.5, rounds up to 3
        assert_eq!(tool.portal_fee(PRV_ID, 25, 10.0, 0).unwrap(), 3);
    }

    #[test]
    fn test_percent_helpers() {
        assert_eq!(up_percent(10, 150).unwrap(), 15);
        assert_eq!(down_percent(15, 150).unwrap(), 10);
        assert!(mul_div(1, 1, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_usd_round_trip_within_one_unit(
            amount in 0u64..=1_000_000_000_000_000_000u64,
            asset_idx in 0usize..4,
        ) {
            let params = PortalParams::default();
            let rates = rates();
            let tool = ExchangeRateTool::new(&rates, &params);
            let asset = [PRV_ID, PORTAL_BTC_ID, PORTAL_BNB_ID, USDT_ID][asset_idx];
            let back = tool.from_usd(asset, tool.to_usd(asset, amount).unwrap()).unwrap();
            prop_assert!(back <= amount);
            prop_assert!(amount - back <= 1);
        }
    }
}
