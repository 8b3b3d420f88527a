//! Per-site privacy epochs.
//!
//! Epochs partition time into equal slices, but their origin is randomized
//! per site so that rollovers are not observable across sites. The origin
//! is sampled lazily on a site's first use and stays fixed until that
//! site's browsing state is forgotten.

use std::{collections::HashMap, time::Duration};

use crate::{
    error::AttributionError,
    pds::traits::{draw_unit, UnitRng},
    site::Site,
    time::Timestamp,
};

/// Index of a privacy epoch for some site. Negative for instants before
/// the site's randomized origin.
pub type EpochIndex = i64;

/// Epoch index of `t` measured from `origin` in slices of `period`.
pub fn epoch_index(origin: Timestamp, period: Duration, t: Timestamp) -> EpochIndex {
    let period_millis = period.as_millis() as i64;
    (t.as_millis() - origin.as_millis()).div_euclid(period_millis)
}

/// Maps (site, instant) to an epoch index using a per-site randomized
/// origin.
#[derive(Debug)]
pub struct EpochOracle {
    period: Duration,
    starts: HashMap<Site, Timestamp>,
}

impl EpochOracle {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            starts: HashMap::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Epoch index of `t` for `site`, sampling the site's origin uniformly
    /// from `[t - period, t]` if this is the site's first use.
    pub fn epoch_at(
        &mut self,
        site: &Site,
        t: Timestamp,
        rng: &mut dyn UnitRng,
    ) -> Result<EpochIndex, AttributionError> {
        let origin = match self.starts.get(site) {
            Some(origin) => *origin,
            None => {
                let p = draw_unit(rng)?;
                let offset = (p * self.period.as_millis() as f64) as i64;
                let origin = Timestamp::from_millis(t.as_millis() - offset);
                self.starts.insert(site.clone(), origin);
                origin
            }
        };
        Ok(epoch_index(origin, self.period, t))
    }

    /// The site's origin, if one has been sampled.
    pub fn origin(&self, site: &Site) -> Option<Timestamp> {
        self.starts.get(site).copied()
    }

    pub fn forget_sites(&mut self, sites: &[Site]) {
        self.starts.retain(|site, _| !sites.contains(site));
    }

    pub fn clear(&mut self) {
        self.starts.clear();
    }

    pub fn starts(&self) -> &HashMap<Site, Timestamp> {
        &self.starts
    }
}
