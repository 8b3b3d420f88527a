use std::collections::HashMap;

use log::warn;

use crate::{
    budget::filter::{FilterStatus, PrivacyBudgetFilter},
    epochs::EpochIndex,
    site::Site,
};

/// Hard ceiling on the epsilon a single conversion may spend.
pub const MAX_CONVERSION_EPSILON: f64 = 14.0;

/// Slack granted on top of the configured budget when a cell is first
/// touched. Absorbs the rounding of the first deduction; part of the
/// ledger contract.
const INITIAL_GRACE_MICRO_EPSILONS: u64 = 1_000;

const MICRO_EPSILONS_PER_EPSILON: f64 = 1e6;

/// The privacy loss charged for releasing one histogram.
///
/// `l1_norm` carries the observed L1 norm when the histogram is known
/// before payment (single-epoch queries); when absent, the worst-case
/// sensitivity `2 * value` is charged instead.
#[derive(Debug, Clone)]
pub struct PrivacyLoss {
    pub epsilon: f64,
    pub value: u32,
    pub max_value: u32,
    pub l1_norm: Option<u64>,
}

impl PrivacyLoss {
    /// Cost in micro-epsilons, or `None` when the implied epsilon spend is
    /// negative, non-finite, or above [`MAX_CONVERSION_EPSILON`].
    fn cost_micro_epsilons(&self) -> Option<u64> {
        let sensitivity = match self.l1_norm {
            Some(l1) => l1 as f64,
            None => 2.0 * f64::from(self.value),
        };
        let noise_scale = 2.0 * f64::from(self.max_value) / self.epsilon;
        let raw = sensitivity / noise_scale;
        if !raw.is_finite() || raw < 0.0 || raw > MAX_CONVERSION_EPSILON {
            return None;
        }
        Some((raw * MICRO_EPSILONS_PER_EPSILON).ceil() as u64)
    }
}

/// Per-(site, epoch) privacy budget cells, created lazily on first use.
#[derive(Debug)]
pub struct BudgetLedger {
    capacity_micro_epsilons: u64,
    filters: HashMap<(Site, EpochIndex), PrivacyBudgetFilter>,
}

impl BudgetLedger {
    pub fn new(capacity_micro_epsilons: u64) -> Self {
        Self {
            capacity_micro_epsilons,
            filters: HashMap::new(),
        }
    }

    /// Tries to pay `loss` out of the (site, epoch) cell. An unpayable or
    /// out-of-bounds loss zeroizes the cell and reports `OutOfBudget`;
    /// the caller is expected to degrade its histogram to zeros.
    pub fn check_and_consume(
        &mut self,
        site: &Site,
        epoch: EpochIndex,
        loss: &PrivacyLoss,
    ) -> FilterStatus {
        let filter = self.filter_entry(site, epoch);
        let status = match loss.cost_micro_epsilons() {
            Some(cost) => filter.check_and_consume(cost),
            None => {
                filter.zeroize();
                FilterStatus::OutOfBudget
            }
        };
        if status == FilterStatus::OutOfBudget {
            warn!("privacy budget exhausted for ({site}, epoch {epoch})");
        }
        status
    }

    /// Sets the (site, epoch) cell to zero, creating it first if absent.
    pub fn zeroize(&mut self, site: &Site, epoch: EpochIndex) {
        self.filter_entry(site, epoch).zeroize();
    }

    /// Drops every cell belonging to one of `sites`.
    pub fn remove_sites(&mut self, sites: &[Site]) {
        self.filters.retain(|(site, _), _| !sites.contains(site));
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    /// Remaining budget for a cell, if it has been touched. For local
    /// visualization only; must not be shared off-device.
    pub fn remaining_micro_epsilons(
        &self,
        site: &Site,
        epoch: EpochIndex,
    ) -> Option<u64> {
        self.filters
            .get(&(site.clone(), epoch))
            .map(PrivacyBudgetFilter::remaining_micro_epsilons)
    }

    pub fn entries(&self) -> &HashMap<(Site, EpochIndex), PrivacyBudgetFilter> {
        &self.filters
    }

    fn filter_entry(
        &mut self,
        site: &Site,
        epoch: EpochIndex,
    ) -> &mut PrivacyBudgetFilter {
        let capacity = self.capacity_micro_epsilons + INITIAL_GRACE_MICRO_EPSILONS;
        self.filters
            .entry((site.clone(), epoch))
            .or_insert_with(|| PrivacyBudgetFilter::new(capacity))
    }
}
