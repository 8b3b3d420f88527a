use std::{collections::BTreeSet, time::Duration};

use url::Url;

use crate::{
    budget::MAX_CONVERSION_EPSILON,
    error::AttributionError,
    events::impression::Impression,
    pds::config::{AggregationService, Config},
    site::Site,
    time::{days, Timestamp},
};

pub const DEFAULT_EPSILON: f64 = 1.0;
pub const DEFAULT_VALUE: u32 = 1;
pub const DEFAULT_MAX_VALUE: u32 = 1;

/// Options accepted by `measure_conversion`. [`ConversionOptions::new`]
/// fills every optional field with its default; `lookback_days: None`
/// means the configured maximum.
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub aggregation_service: String,
    pub histogram_size: usize,
    pub epsilon: f64,
    pub lookback_days: Option<u32>,
    pub credit: Vec<f64>,
    pub value: u32,
    pub max_value: u32,
    pub match_values: Vec<u64>,
    pub impression_sites: Vec<String>,
    pub impression_callers: Vec<String>,
}

impl ConversionOptions {
    pub fn new(aggregation_service: impl Into<String>, histogram_size: usize) -> Self {
        Self {
            aggregation_service: aggregation_service.into(),
            histogram_size,
            epsilon: DEFAULT_EPSILON,
            lookback_days: None,
            credit: vec![1.0],
            value: DEFAULT_VALUE,
            max_value: DEFAULT_MAX_VALUE,
            match_values: Vec::new(),
            impression_sites: Vec::new(),
            impression_callers: Vec::new(),
        }
    }
}

/// A fully validated conversion query. Construction performs every input
/// check; the backend only ever operates on one of these.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub top_level_site: Site,
    /// The caller measuring the conversion: the intermediary when one is
    /// present, the top-level site otherwise.
    pub conversion_caller: Site,
    /// Normalized key into the configured aggregation-service map.
    pub aggregation_service: String,
    pub histogram_size: usize,
    pub epsilon: f64,
    pub lookback: Duration,
    pub credit: Vec<f64>,
    pub value: u32,
    pub max_value: u32,
    pub match_values: BTreeSet<u64>,
    pub impression_sites: BTreeSet<Site>,
    pub impression_callers: BTreeSet<Site>,
}

impl ConversionRequest {
    pub fn validate(
        top_level_site: &str,
        intermediary_site: Option<&str>,
        options: ConversionOptions,
        config: &Config,
        aggregation_services: &std::collections::HashMap<String, AggregationService>,
    ) -> Result<Self, AttributionError> {
        let top_level_site = Site::parse(top_level_site)?;
        let conversion_caller = match intermediary_site {
            Some(raw) => Site::parse(raw)?,
            None => top_level_site.clone(),
        };

        let url = Url::parse(&options.aggregation_service).map_err(|e| {
            AttributionError::InvalidSyntax(format!(
                "aggregation service URL {:?}: {e}",
                options.aggregation_service
            ))
        })?;
        if url.as_str() != options.aggregation_service {
            return Err(AttributionError::InvalidSyntax(format!(
                "aggregation service URL {:?} is not in normal form",
                options.aggregation_service
            )));
        }
        if !aggregation_services.contains_key(url.as_str()) {
            return Err(AttributionError::UnknownReference(
                options.aggregation_service.clone(),
            ));
        }

        if options.histogram_size < 1 || options.histogram_size > config.max_histogram_size {
            return Err(AttributionError::OutOfRange(format!(
                "histogram_size {} not in [1, {}]",
                options.histogram_size, config.max_histogram_size
            )));
        }
        if !options.epsilon.is_finite()
            || options.epsilon <= 0.0
            || options.epsilon > MAX_CONVERSION_EPSILON
        {
            return Err(AttributionError::OutOfRange(format!(
                "epsilon {} not in (0, {MAX_CONVERSION_EPSILON}]",
                options.epsilon
            )));
        }
        if options.value < 1 {
            return Err(AttributionError::OutOfRange("value must be positive".into()));
        }
        if options.max_value < 1 || options.value > options.max_value {
            return Err(AttributionError::OutOfRange(format!(
                "value {} must not exceed max_value {}",
                options.value, options.max_value
            )));
        }
        if options.credit.is_empty() || options.credit.len() > config.max_credit_size {
            return Err(AttributionError::OutOfRange(format!(
                "credit length {} not in [1, {}]",
                options.credit.len(),
                config.max_credit_size
            )));
        }
        if options.credit.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return Err(AttributionError::OutOfRange(
                "credit entries must be positive and finite".into(),
            ));
        }
        let lookback_days = match options.lookback_days {
            Some(0) => {
                return Err(AttributionError::OutOfRange(
                    "lookback_days must be positive".into(),
                ))
            }
            Some(requested) => requested.min(config.max_lookback_days),
            None => config.max_lookback_days,
        };

        let impression_sites = options
            .impression_sites
            .iter()
            .map(|raw| Site::parse(raw))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let impression_callers = options
            .impression_callers
            .iter()
            .map(|raw| Site::parse(raw))
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self {
            top_level_site,
            conversion_caller,
            aggregation_service: options.aggregation_service,
            histogram_size: options.histogram_size,
            epsilon: options.epsilon,
            lookback: days(lookback_days),
            credit: options.credit,
            value: options.value,
            max_value: options.max_value,
            match_values: options.match_values.into_iter().collect(),
            impression_sites,
            impression_callers,
        })
    }

    /// The relevance filter this query applies to stored impressions.
    pub fn selector(&self, now: Timestamp) -> ImpressionSelector {
        ImpressionSelector {
            top_level_site: self.top_level_site.clone(),
            conversion_caller: self.conversion_caller.clone(),
            now,
            lookback: self.lookback,
            match_values: self.match_values.clone(),
            impression_sites: self.impression_sites.clone(),
            impression_callers: self.impression_callers.clone(),
        }
    }
}

/// Relevance filter for one conversion query. Epoch bucketing is separate;
/// this covers liveness, the lookback window, and the site/caller/value
/// filters, where an empty set means unconstrained.
#[derive(Debug, Clone)]
pub struct ImpressionSelector {
    pub top_level_site: Site,
    pub conversion_caller: Site,
    pub now: Timestamp,
    pub lookback: Duration,
    pub match_values: BTreeSet<u64>,
    pub impression_sites: BTreeSet<Site>,
    pub impression_callers: BTreeSet<Site>,
}

impl ImpressionSelector {
    pub fn is_relevant(&self, impression: &Impression) -> bool {
        if impression.is_expired(self.now) {
            return false;
        }
        if self.now > impression.timestamp + self.lookback {
            return false;
        }
        if !impression.conversion_sites.is_empty()
            && !impression.conversion_sites.contains(&self.top_level_site)
        {
            return false;
        }
        if !impression.conversion_callers.is_empty()
            && !impression.conversion_callers.contains(&self.conversion_caller)
        {
            return false;
        }
        if !self.match_values.is_empty()
            && !self.match_values.contains(&impression.match_value)
        {
            return false;
        }
        if !self.impression_sites.is_empty()
            && !self.impression_sites.contains(&impression.impression_site)
        {
            return false;
        }
        if !self.impression_callers.is_empty()
            && !self.impression_callers.contains(impression.impression_caller())
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn services() -> HashMap<String, AggregationService> {
        HashMap::from([(
            "https://aggregator.example/".to_string(),
            AggregationService {
                protocol: "dap".to_string(),
            },
        )])
    }

    fn options() -> ConversionOptions {
        ConversionOptions::new("https://aggregator.example/", 5)
    }

    fn validate(options: ConversionOptions) -> Result<ConversionRequest, AttributionError> {
        ConversionRequest::validate("a.example", None, options, &Config::default(), &services())
    }

    #[test]
    fn defaults_validate() {
        let request = validate(options()).unwrap();
        assert_eq!(request.conversion_caller, request.top_level_site);
        assert_eq!(request.lookback, days(Config::default().max_lookback_days));
        assert_eq!(request.credit, vec![1.0]);
    }

    #[test]
    fn intermediary_becomes_the_conversion_caller() {
        let request = ConversionRequest::validate(
            "a.example",
            Some("embed.example"),
            options(),
            &Config::default(),
            &services(),
        )
        .unwrap();
        assert_eq!(request.conversion_caller.as_str(), "embed.example");
    }

    #[test]
    fn unknown_service_is_a_reference_error() {
        let mut opts = options();
        opts.aggregation_service = "https://other.example/".to_string();
        assert!(matches!(
            validate(opts),
            Err(AttributionError::UnknownReference(_))
        ));
    }

    #[test]
    fn non_normalized_service_url_is_a_syntax_error() {
        let mut opts = options();
        // Parses, but normalizes to lowercase host plus trailing slash.
        opts.aggregation_service = "https://Aggregator.example".to_string();
        assert!(matches!(
            validate(opts),
            Err(AttributionError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn numeric_ranges_are_enforced() {
        let cases: Vec<Box<dyn Fn(&mut ConversionOptions)>> = vec![
            Box::new(|o| o.histogram_size = 0),
            Box::new(|o| o.histogram_size = Config::default().max_histogram_size + 1),
            Box::new(|o| o.epsilon = 0.0),
            Box::new(|o| o.epsilon = MAX_CONVERSION_EPSILON + 1.0),
            Box::new(|o| o.epsilon = f64::NAN),
            Box::new(|o| o.value = 0),
            Box::new(|o| {
                o.value = 10;
                o.max_value = 9;
            }),
            Box::new(|o| o.credit = vec![]),
            Box::new(|o| o.credit = vec![1.0, -2.0]),
            Box::new(|o| o.credit = vec![f64::INFINITY]),
            Box::new(|o| o.lookback_days = Some(0)),
        ];
        for mutate in cases {
            let mut opts = options();
            mutate(&mut opts);
            assert!(matches!(
                validate(opts),
                Err(AttributionError::OutOfRange(_))
            ));
        }
    }

    #[test]
    fn lookback_is_capped_at_the_configured_maximum() {
        let mut opts = options();
        opts.lookback_days = Some(10_000);
        let request = validate(opts).unwrap();
        assert_eq!(request.lookback, days(Config::default().max_lookback_days));
    }

    #[test]
    fn selector_honors_empty_sets_as_unconstrained() {
        let request = validate(options()).unwrap();
        let selector = request.selector(Timestamp::from_millis(1_000));
        let imp = Impression {
            impression_site: Site::parse("pub.example").unwrap(),
            intermediary_site: None,
            conversion_sites: BTreeSet::new(),
            conversion_callers: BTreeSet::new(),
            match_value: 42,
            timestamp: Timestamp::from_millis(0),
            lifetime: days(30),
            histogram_index: 0,
            priority: 0,
        };
        assert!(selector.is_relevant(&imp));
    }

    #[test]
    fn selector_applies_all_filters() {
        let mut opts = options();
        opts.match_values = vec![7];
        opts.impression_sites = vec!["pub.example".to_string()];
        opts.impression_callers = vec!["embed.example".to_string()];
        let request = validate(opts).unwrap();
        let selector = request.selector(Timestamp::from_millis(1_000));

        let mut imp = Impression {
            impression_site: Site::parse("pub.example").unwrap(),
            intermediary_site: Some(Site::parse("embed.example").unwrap()),
            conversion_sites: [Site::parse("a.example").unwrap()].into(),
            conversion_callers: [Site::parse("a.example").unwrap()].into(),
            match_value: 7,
            timestamp: Timestamp::from_millis(0),
            lifetime: days(30),
            histogram_index: 0,
            priority: 0,
        };
        assert!(selector.is_relevant(&imp));

        imp.match_value = 8;
        assert!(!selector.is_relevant(&imp));
        imp.match_value = 7;

        imp.conversion_sites = [Site::parse("other.example").unwrap()].into();
        assert!(!selector.is_relevant(&imp));
        imp.conversion_sites = BTreeSet::new();

        imp.intermediary_site = None;
        // impression caller falls back to pub.example, not in the filter
        assert!(!selector.is_relevant(&imp));
    }

    #[test]
    fn selector_rejects_expired_and_out_of_window_impressions() {
        let mut opts = options();
        opts.lookback_days = Some(1);
        let request = validate(opts).unwrap();

        let imp = Impression {
            impression_site: Site::parse("pub.example").unwrap(),
            intermediary_site: None,
            conversion_sites: BTreeSet::new(),
            conversion_callers: BTreeSet::new(),
            match_value: 0,
            timestamp: Timestamp::from_millis(0),
            lifetime: Duration::from_secs(3_600),
            histogram_index: 0,
            priority: 0,
        };

        let within = request.selector(Timestamp::from_millis(3_599_000));
        assert!(within.is_relevant(&imp));

        // Past the one-hour lifetime but inside the one-day lookback.
        let expired = request.selector(Timestamp::from_millis(3_700_000));
        assert!(!expired.is_relevant(&imp));
    }
}
