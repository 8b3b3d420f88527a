use log::debug;

use crate::{
    epochs::EpochIndex,
    events::impression::Impression,
    queries::conversion::ImpressionSelector,
    site::Site,
    time::Timestamp,
};

/// Append-only log of live impressions, in arrival order.
///
/// Matching iterates in storage order; attribution relies on that order
/// being deterministic.
#[derive(Debug, Default)]
pub struct ImpressionStore {
    impressions: Vec<Impression>,
}

impl ImpressionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, impression: Impression) {
        debug!("storing impression {impression:?}");
        self.impressions.push(impression);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Impression> {
        self.impressions.iter()
    }

    pub fn len(&self) -> usize {
        self.impressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.impressions.is_empty()
    }

    pub fn retain(&mut self, predicate: impl FnMut(&Impression) -> bool) {
        self.impressions.retain(predicate);
    }

    pub fn clear(&mut self) {
        self.impressions.clear();
    }

    /// Clones the impressions that fall in `epoch` (per `epoch_of`, the
    /// converting site's epoch mapping) and satisfy `selector`, in storage
    /// order.
    pub fn relevant_in_epoch(
        &self,
        epoch: EpochIndex,
        epoch_of: impl Fn(Timestamp) -> EpochIndex,
        selector: &ImpressionSelector,
    ) -> Vec<Impression> {
        self.impressions
            .iter()
            .filter(|imp| epoch_of(imp.timestamp) == epoch)
            .filter(|imp| selector.is_relevant(imp))
            .cloned()
            .collect()
    }

    /// Removes or narrows impressions that reference `site`.
    ///
    /// An impression is dropped when `site` is its impression site (with no
    /// intermediary), its intermediary site, or the last entry of one of
    /// its site sets. Deleting `site` from a still-non-empty set narrows
    /// the stored impression in place instead.
    pub fn clear_for_site(&mut self, site: &Site) {
        self.impressions.retain_mut(|imp| {
            if imp.intermediary_site.is_none() && imp.impression_site == *site {
                return false;
            }
            if imp.intermediary_site.as_ref() == Some(site) {
                return false;
            }
            if imp.conversion_sites.contains(site) {
                if imp.conversion_sites.len() == 1 {
                    return false;
                }
                imp.conversion_sites.remove(site);
            }
            if imp.conversion_callers.contains(site) {
                if imp.conversion_callers.len() == 1 {
                    return false;
                }
                imp.conversion_callers.remove(site);
            }
            true
        });
    }
}
