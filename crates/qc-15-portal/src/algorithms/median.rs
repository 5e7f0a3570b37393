//! Median exchange rates from one block's accepted submissions.

use crate::domain::{ExchangeRatesRequest, FinalExchangeRates};
use std::collections::BTreeMap;

/// Median of a set of rates; an even count averages the two middle values.
pub fn median_rate(values: &mut [u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        ((values[mid - 1] as u128 + values[mid] as u128) / 2) as u64
    } else {
        values[mid]
    }
}

/// Merge the per-token medians of `requests` into the current final rates.
///
/// Returns `None` only when there are neither current rates nor requests.
pub fn pick_final_exchange_rates(
    requests: &BTreeMap<String, ExchangeRatesRequest>,
    current: Option<&FinalExchangeRates>,
) -> Option<FinalExchangeRates> {
    if requests.is_empty() {
        return current.cloned();
    }
    let mut submitted: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    for request in requests.values() {
        for info in &request.rates {
            submitted.entry(info.token_id.as_str()).or_default().push(info.rate);
        }
    }

    let mut final_rates = current.cloned().unwrap_or_default();
    for (token, mut values) in submitted {
        let median = median_rate(&mut values);
        if median > 0 {
            final_rates.rates.insert(token.to_string(), median);
        }
    }
    Some(final_rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExchangeRateInfo;

    fn request(sender: &str, rates: &[(&str, u64)]) -> ExchangeRatesRequest {
        ExchangeRatesRequest {
            sender_address: sender.to_string(),
            rates: rates
                .iter()
                .map(|(token, rate)| ExchangeRateInfo {
                    token_id: token.to_string(),
                    rate: *rate,
                })
                .collect(),
        }
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median_rate(&mut [5, 1, 3]), 3);
        assert_eq!(median_rate(&mut [4, 1, 3, 2]), 2);
        assert_eq!(median_rate(&mut []), 0);
    }

    #[test]
    fn test_pick_final_rates_merges() {
        let current = FinalExchangeRates {
            rates: BTreeMap::from([("btc".to_string(), 9), ("bnb".to_string(), 4)]),
        };
        let requests = BTreeMap::from([
            ("tx1".to_string(), request("s1", &[("btc", 10), ("prv", 1)])),
            ("tx2".to_string(), request("s2", &[("btc", 30)])),
            ("tx3".to_string(), request("s3", &[("btc", 20)])),
        ]);
        let rates = pick_final_exchange_rates(&requests, Some(&current)).unwrap();
        assert_eq!(rates.rates["btc"], 20);
        assert_eq!(rates.rates["prv"], 1);
        assert_eq!(rates.rates["bnb"], 4);
    }

    #[test]
    fn test_no_requests_keeps_current() {
        assert_eq!(pick_final_exchange_rates(&BTreeMap::new(), None), None);
    }
}
