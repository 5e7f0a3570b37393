//! Beacon Clock Adapter
//!
//! Implements `ChainRetriever` assuming a fixed beacon block interval.

use crate::ports::outbound::ChainRetriever;

/// Beacon timing from a constant block interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockIntervalClock {
    interval_secs: u64,
}

impl BlockIntervalClock {
    /// Clock with `interval_secs` seconds per beacon block.
    pub fn new(interval_secs: u64) -> Self {
        Self { interval_secs }
    }

    /// Seconds per beacon block.
    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }
}

impl ChainRetriever for BlockIntervalClock {
    fn is_block_time_reached(
        &self,
        current_height: u64,
        since_height: u64,
        timeout_secs: u64,
    ) -> bool {
        if current_height < since_height {
            return false;
        }
        (current_height - since_height).saturating_mul(self.interval_secs) >= timeout_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_boundary() {
        let clock = BlockIntervalClock::new(40);
        assert!(!clock.is_block_time_reached(122, 100, 900));
        assert!(clock.is_block_time_reached(123, 100, 900));
        assert!(!clock.is_block_time_reached(90, 100, 0));
    }
}
