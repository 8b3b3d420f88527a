use std::time::Duration;

use serde::Serialize;

/// Protocol descriptor for a configured aggregation service, keyed in the
/// backend by its normalized URL.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationService {
    pub protocol: String,
}

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_conversion_sites_per_impression: usize,
    pub max_conversion_callers_per_impression: usize,
    pub max_credit_size: usize,
    pub max_lookback_days: u32,
    pub max_histogram_size: usize,
    /// Per-(site, epoch) budget, in micro-epsilons.
    pub privacy_budget_micro_epsilons: u64,
    /// Length of one privacy epoch.
    pub privacy_budget_epoch: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_conversion_sites_per_impression: 10,
            max_conversion_callers_per_impression: 10,
            max_credit_size: 100,
            max_lookback_days: 30,
            max_histogram_size: 1_024,
            privacy_budget_micro_epsilons: 1_000_000,
            privacy_budget_epoch: Duration::from_secs(7 * 86_400),
        }
    }
}
