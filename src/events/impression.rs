use std::{collections::BTreeSet, time::Duration};

use serde::Serialize;

use crate::{site::Site, time::Timestamp};

pub const DEFAULT_MATCH_VALUE: u64 = 0;
pub const DEFAULT_LIFETIME_DAYS: u32 = 30;
pub const DEFAULT_PRIORITY: i32 = 0;

/// A recorded ad impression, bound to the top-level site it was shown on.
///
/// Immutable after creation except for the two site sets, which
/// [`ImpressionStore::clear_for_site`](crate::events::store::ImpressionStore::clear_for_site)
/// may narrow in place.
#[derive(Debug, Clone, Serialize)]
pub struct Impression {
    /// Registrable site the ad was shown on.
    pub impression_site: Site,
    /// Registrable site of the embedded frame that saved the impression,
    /// when different from the top-level site.
    pub intermediary_site: Option<Site>,
    /// Sites allowed to convert against this impression; empty means any.
    pub conversion_sites: BTreeSet<Site>,
    /// Callers allowed to measure against this impression; empty means any.
    pub conversion_callers: BTreeSet<Site>,
    pub match_value: u64,
    pub timestamp: Timestamp,
    pub lifetime: Duration,
    pub histogram_index: usize,
    pub priority: i32,
}

impl Impression {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.timestamp + self.lifetime
    }

    /// The site a conversion caller must be authorized against: the
    /// intermediary when one saved the impression, the impression site
    /// otherwise.
    pub fn impression_caller(&self) -> &Site {
        self.intermediary_site.as_ref().unwrap_or(&self.impression_site)
    }
}

/// Options accepted by `save_impression`. [`SaveImpressionOptions::new`]
/// fills every optional field with its default.
#[derive(Debug, Clone)]
pub struct SaveImpressionOptions {
    pub histogram_index: usize,
    pub match_value: u64,
    pub conversion_sites: Vec<String>,
    pub conversion_callers: Vec<String>,
    pub lifetime_days: u32,
    pub priority: i32,
}

impl SaveImpressionOptions {
    pub fn new(histogram_index: usize) -> Self {
        Self {
            histogram_index,
            match_value: DEFAULT_MATCH_VALUE,
            conversion_sites: Vec::new(),
            conversion_callers: Vec::new(),
            lifetime_days: DEFAULT_LIFETIME_DAYS,
            priority: DEFAULT_PRIORITY,
        }
    }
}
