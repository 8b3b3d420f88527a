use std::collections::{BTreeSet, HashMap};

use log::debug;
use url::Url;

use crate::{
    budget::{BudgetLedger, FilterStatus, PrivacyBudgetFilter, PrivacyLoss},
    epochs::{epoch_index, EpochIndex, EpochOracle},
    error::AttributionError,
    events::{
        impression::{Impression, SaveImpressionOptions},
        store::ImpressionStore,
    },
    pds::{
        config::{AggregationService, Config},
        traits::{Clock, ReportEncryptor, UnitRng},
    },
    queries::{
        allocator::{fairly_allocate_credit, fill_histogram, rank_last_n_touch},
        conversion::{ConversionOptions, ConversionRequest},
    },
    site::Site,
    time::{days, Timestamp},
};

/// Result of measuring one conversion.
#[derive(Debug)]
pub struct ConversionReport {
    /// The histogram, sealed for the requested aggregation service.
    pub report: Vec<u8>,
    /// Present only when the backend was built with
    /// [`AttributionBackend::with_unencrypted_histograms`].
    pub unencrypted_histogram: Option<Vec<u32>>,
}

/// The attribution measurement engine: impression log, per-site epoch
/// oracle, and privacy budget ledger behind one synchronous façade.
///
/// Single-threaded by contract; the host serializes calls per profile.
pub struct AttributionBackend<C: Clock, R: UnitRng, E: ReportEncryptor> {
    config: Config,
    aggregation_services: HashMap<String, AggregationService>,
    clock: C,
    rng: R,
    encryptor: E,
    impressions: ImpressionStore,
    ledger: BudgetLedger,
    epochs: EpochOracle,
    enabled: bool,
    include_unencrypted_histogram: bool,
    last_browsing_history_clear: Option<Timestamp>,
}

impl<C: Clock, R: UnitRng, E: ReportEncryptor> AttributionBackend<C, R, E> {
    /// Builds a backend. Every aggregation-service key must already be a
    /// normalized URL; anything else is a construction-time error.
    pub fn new(
        config: Config,
        aggregation_services: HashMap<String, AggregationService>,
        clock: C,
        rng: R,
        encryptor: E,
    ) -> Result<Self, AttributionError> {
        for key in aggregation_services.keys() {
            let url = Url::parse(key).map_err(|e| {
                AttributionError::InvalidSyntax(format!(
                    "aggregation service key {key:?}: {e}"
                ))
            })?;
            if url.as_str() != key {
                return Err(AttributionError::InvalidSyntax(format!(
                    "aggregation service key {key:?} is not in normal form"
                )));
            }
        }
        let ledger = BudgetLedger::new(config.privacy_budget_micro_epsilons);
        let epochs = EpochOracle::new(config.privacy_budget_epoch);
        Ok(Self {
            config,
            aggregation_services,
            clock,
            rng,
            encryptor,
            impressions: ImpressionStore::new(),
            ledger,
            epochs,
            enabled: true,
            include_unencrypted_histogram: false,
            last_browsing_history_clear: None,
        })
    }

    /// Debug/test toggle: also return histograms in the clear.
    pub fn with_unencrypted_histograms(mut self, include: bool) -> Self {
        self.include_unencrypted_histogram = include;
        self
    }

    /// Records an impression on `impression_site`. When the backend is
    /// disabled the inputs are still validated but nothing is stored.
    pub fn save_impression(
        &mut self,
        impression_site: &str,
        intermediary_site: Option<&str>,
        options: SaveImpressionOptions,
    ) -> Result<(), AttributionError> {
        let impression_site = Site::parse(impression_site)?;
        let intermediary_site = intermediary_site.map(Site::parse).transpose()?;

        if options.conversion_sites.len() > self.config.max_conversion_sites_per_impression {
            return Err(AttributionError::OutOfRange(format!(
                "{} conversion sites exceed the limit of {}",
                options.conversion_sites.len(),
                self.config.max_conversion_sites_per_impression
            )));
        }
        if options.conversion_callers.len() > self.config.max_conversion_callers_per_impression
        {
            return Err(AttributionError::OutOfRange(format!(
                "{} conversion callers exceed the limit of {}",
                options.conversion_callers.len(),
                self.config.max_conversion_callers_per_impression
            )));
        }
        let conversion_sites = options
            .conversion_sites
            .iter()
            .map(|raw| Site::parse(raw))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let conversion_callers = options
            .conversion_callers
            .iter()
            .map(|raw| Site::parse(raw))
            .collect::<Result<BTreeSet<_>, _>>()?;

        if options.histogram_index >= self.config.max_histogram_size {
            return Err(AttributionError::OutOfRange(format!(
                "histogram_index {} not in [0, {})",
                options.histogram_index, self.config.max_histogram_size
            )));
        }
        if options.lifetime_days == 0 {
            return Err(AttributionError::OutOfRange(
                "lifetime_days must be positive".into(),
            ));
        }
        let lifetime = days(options.lifetime_days.min(self.config.max_lookback_days));

        if !self.enabled {
            return Ok(());
        }

        self.impressions.append(Impression {
            impression_site,
            intermediary_site,
            conversion_sites,
            conversion_callers,
            match_value: options.match_value,
            timestamp: self.clock.now(),
            lifetime,
            histogram_index: options.histogram_index,
            priority: options.priority,
        });
        Ok(())
    }

    /// Attributes a conversion on `top_level_site` to stored impressions
    /// and returns the sealed histogram.
    ///
    /// A depleted privacy budget never fails the call: the histogram
    /// degrades to zeros and is sealed all the same, so recipients cannot
    /// distinguish an over-budget device from one without impressions.
    pub fn measure_conversion(
        &mut self,
        top_level_site: &str,
        intermediary_site: Option<&str>,
        options: ConversionOptions,
    ) -> Result<ConversionReport, AttributionError> {
        let request = ConversionRequest::validate(
            top_level_site,
            intermediary_site,
            options,
            &self.config,
            &self.aggregation_services,
        )?;
        debug!(
            "measuring conversion on {} for {}",
            request.top_level_site, request.aggregation_service
        );

        if !self.enabled {
            return self.finish(vec![0; request.histogram_size], &request);
        }

        let now = self.clock.now();
        let site = request.top_level_site.clone();
        let current = self.epochs.epoch_at(&site, now, &mut self.rng)?;
        let earliest = self
            .epochs
            .epoch_at(&site, now - request.lookback, &mut self.rng)?;
        let origin = self.epochs.origin(&site).ok_or_else(|| {
            AttributionError::InvalidState("epoch origin missing after use".into())
        })?;
        let period = self.epochs.period();
        let epoch_of = move |t: Timestamp| epoch_index(origin, period, t);
        let selector = request.selector(now);

        let single_epoch = current == earliest;
        let mut pool = if single_epoch {
            // The deduction happens after allocation, priced at the
            // histogram's observed L1 norm.
            self.impressions.relevant_in_epoch(current, epoch_of, &selector)
        } else {
            // The final histogram is unknown while sweeping, so every
            // epoch that contributes pays the worst case up front; epochs
            // that cannot pay drop out of the pool.
            let start = self.start_epoch(&site, now)?;
            let mut pool = Vec::new();
            for epoch in start..=current {
                let matches =
                    self.impressions.relevant_in_epoch(epoch, epoch_of, &selector);
                if matches.is_empty() {
                    continue;
                }
                let loss = PrivacyLoss {
                    epsilon: request.epsilon,
                    value: request.value,
                    max_value: request.max_value,
                    l1_norm: None,
                };
                if self.ledger.check_and_consume(&site, epoch, &loss)
                    == FilterStatus::Continue
                {
                    pool.extend(matches);
                }
            }
            pool
        };

        if pool.is_empty() {
            return self.finish(vec![0; request.histogram_size], &request);
        }

        rank_last_n_touch(&mut pool, request.credit.len());
        let credit = &request.credit[..pool.len()];
        let allocated = fairly_allocate_credit(credit, request.value, &mut self.rng)?;
        let mut histogram = fill_histogram(&pool, &allocated, request.histogram_size);

        let l1_norm: u64 = histogram.iter().map(|v| u64::from(*v)).sum();
        if l1_norm > u64::from(request.value) {
            return Err(AttributionError::InvalidState(format!(
                "histogram L1 norm {l1_norm} exceeds value {}",
                request.value
            )));
        }

        if single_epoch {
            let loss = PrivacyLoss {
                epsilon: request.epsilon,
                value: request.value,
                max_value: request.max_value,
                l1_norm: Some(l1_norm),
            };
            if self.ledger.check_and_consume(&site, current, &loss)
                == FilterStatus::OutOfBudget
            {
                histogram = vec![0; request.histogram_size];
            }
        }

        self.finish(histogram, &request)
    }

    /// Removes impressions tied to `site` and narrows site sets that
    /// mention it; part of clearing a site's cookies-and-site-data.
    pub fn clear_impressions_for_site(&mut self, site: &str) -> Result<(), AttributionError> {
        let site = Site::parse(site)?;
        self.impressions.clear_for_site(&site);
        Ok(())
    }

    /// Drops impressions whose lifetime has elapsed. Idempotent.
    pub fn clear_expired_impressions(&mut self) {
        let now = self.clock.now();
        self.impressions.retain(|imp| !imp.is_expired(now));
    }

    /// Clears browsing state.
    ///
    /// With `forget_visits` unset, the given sites' budget cells are
    /// zeroized for every epoch in the attribution window and nothing else
    /// changes. With it set, impressions, budgets, and epoch origins are
    /// dropped (for the given sites, or wholesale when `sites` is empty)
    /// and the browsing-history clear instant is recorded.
    pub fn clear_state(
        &mut self,
        sites: &[&str],
        forget_visits: bool,
    ) -> Result<(), AttributionError> {
        let sites = sites
            .iter()
            .map(|raw| Site::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        if !forget_visits {
            if sites.is_empty() {
                return Err(AttributionError::OutOfRange(
                    "clearing budgets requires at least one site".into(),
                ));
            }
            let now = self.clock.now();
            for site in &sites {
                let start = self.start_epoch(site, now)?;
                let current = self.epochs.epoch_at(site, now, &mut self.rng)?;
                for epoch in start..=current {
                    self.ledger.zeroize(site, epoch);
                }
            }
            return Ok(());
        }

        let now = self.clock.now();
        if sites.is_empty() {
            self.impressions.clear();
            self.ledger.clear();
            self.epochs.clear();
        } else {
            self.impressions
                .retain(|imp| !sites.contains(&imp.impression_site));
            self.ledger.remove_sites(&sites);
            self.epochs.forget_sites(&sites);
        }
        self.last_browsing_history_clear = Some(now);
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn impressions(&self) -> impl Iterator<Item = &Impression> {
        self.impressions.iter()
    }

    pub fn privacy_budget_entries(
        &self,
    ) -> &HashMap<(Site, EpochIndex), PrivacyBudgetFilter> {
        self.ledger.entries()
    }

    pub fn epoch_starts(&self) -> &HashMap<Site, Timestamp> {
        self.epochs.starts()
    }

    pub fn last_browsing_history_clear(&self) -> Option<Timestamp> {
        self.last_browsing_history_clear
    }

    pub fn aggregation_services(&self) -> &HashMap<String, AggregationService> {
        &self.aggregation_services
    }

    /// First epoch a query on `site` may reach back into: the epoch of
    /// `now - max_lookback`, pushed forward past the two-epoch quarantine
    /// that follows a browsing-history clear.
    fn start_epoch(
        &mut self,
        site: &Site,
        now: Timestamp,
    ) -> Result<EpochIndex, AttributionError> {
        let earliest = self.epochs.epoch_at(
            site,
            now - days(self.config.max_lookback_days),
            &mut self.rng,
        )?;
        match self.last_browsing_history_clear {
            Some(cleared) => {
                let clear_epoch = self.epochs.epoch_at(site, cleared, &mut self.rng)?;
                Ok(earliest.max(clear_epoch + 2))
            }
            None => Ok(earliest),
        }
    }

    fn finish(
        &mut self,
        histogram: Vec<u32>,
        request: &ConversionRequest,
    ) -> Result<ConversionReport, AttributionError> {
        let service = self
            .aggregation_services
            .get(&request.aggregation_service)
            .ok_or_else(|| {
                AttributionError::InvalidState(
                    "validated aggregation service disappeared".into(),
                )
            })?;
        let report = self.encryptor.seal(service, &histogram)?;
        Ok(ConversionReport {
            report,
            unencrypted_histogram: self
                .include_unencrypted_histogram
                .then_some(histogram),
        })
    }
}
