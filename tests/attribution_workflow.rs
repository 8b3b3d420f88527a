//! End-to-end attribution scenarios on a single device: save impressions,
//! measure conversions, inspect the resulting histograms.

mod common;

use std::{collections::HashMap, time::Duration};

use common::logging;
use ppalib::{
    events::SaveImpressionOptions,
    pds::{
        traits::{ManualClock, PassthroughEncryptor, ScriptedRng},
        AggregationService, AttributionBackend, Config,
    },
    queries::ConversionOptions,
    site::Site,
    time::Timestamp,
};

const SERVICE: &str = "https://aggregator.example/";

type TestBackend = AttributionBackend<ManualClock, ScriptedRng, PassthroughEncryptor>;

fn services() -> HashMap<String, AggregationService> {
    HashMap::from([(
        SERVICE.to_string(),
        AggregationService {
            protocol: "dap".to_string(),
        },
    )])
}

/// Backend with a pinned epoch-origin draw (p = 0.5) and a host-held clock
/// starting at t = 0.
fn backend_with_tape(config: Config, tape: Vec<f64>) -> (TestBackend, ManualClock) {
    logging::init_default_logging();
    let clock = ManualClock::new(Timestamp::from_millis(0));
    let backend = AttributionBackend::new(
        config,
        services(),
        clock.clone(),
        ScriptedRng::new(tape),
        PassthroughEncryptor,
    )
    .unwrap()
    .with_unencrypted_histograms(true);
    (backend, clock)
}

fn backend() -> (TestBackend, ManualClock) {
    backend_with_tape(Config::default(), vec![0.5])
}

fn conversion(histogram_size: usize, value: u32) -> ConversionOptions {
    let mut options = ConversionOptions::new(SERVICE, histogram_size);
    options.value = value;
    options.max_value = value;
    options
}

#[test]
fn single_impression_gets_full_credit() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    backend.save_impression("a.example", None, SaveImpressionOptions::new(3))?;
    clock.advance(Duration::from_secs(1));

    let report = backend.measure_conversion("a.example", None, conversion(5, 100))?;
    let histogram = report.unencrypted_histogram.unwrap();
    assert_eq!(histogram, vec![0, 0, 0, 100, 0]);
    assert_eq!(report.report.len(), 5 * 4);

    // Worst-case multi-epoch pricing: 1.0 epsilon of the budget plus the
    // initialization grace leaves exactly the grace behind.
    let site = Site::parse("a.example").unwrap();
    let entry = &backend.privacy_budget_entries()[&(site, 0)];
    assert_eq!(entry.remaining_micro_epsilons(), 1_000);
    Ok(())
}

#[test]
fn match_value_filter_excludes_the_impression() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    backend.save_impression("a.example", None, SaveImpressionOptions::new(3))?;
    clock.advance(Duration::from_secs(1));

    let mut options = conversion(5, 100);
    options.match_values = vec![7];
    let report = backend.measure_conversion("a.example", None, options)?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0, 0, 0, 0, 0]);

    // No epoch produced matches, so nothing was deducted.
    assert!(backend.privacy_budget_entries().is_empty());
    Ok(())
}

#[test]
fn last_touch_wins_with_a_single_credit_slot() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    backend.save_impression("a.example", None, SaveImpressionOptions::new(1))?;
    clock.advance(Duration::from_secs(1));
    backend.save_impression("a.example", None, SaveImpressionOptions::new(2))?;
    clock.advance(Duration::from_secs(1));

    let report = backend.measure_conversion("a.example", None, conversion(5, 10))?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0, 0, 10, 0, 0]);
    Ok(())
}

#[test]
fn equal_priority_impressions_split_the_credit() -> Result<(), anyhow::Error> {
    // Second tape entry pins the allocator's pairwise draw to 0.5, which
    // keeps the leader and rounds the most recent impression up.
    let (mut backend, clock) = backend_with_tape(Config::default(), vec![0.5, 0.5]);

    backend.save_impression("a.example", None, SaveImpressionOptions::new(1))?;
    clock.advance(Duration::from_secs(1));
    backend.save_impression("a.example", None, SaveImpressionOptions::new(2))?;
    clock.advance(Duration::from_secs(1));

    let mut options = conversion(5, 3);
    options.credit = vec![1.0, 1.0];
    let report = backend.measure_conversion("a.example", None, options)?;
    let histogram = report.unencrypted_histogram.unwrap();
    assert_eq!(histogram, vec![0, 1, 2, 0, 0]);
    assert_eq!(histogram.iter().sum::<u32>(), 3);
    Ok(())
}

#[test]
fn priority_outranks_recency() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    let mut boosted = SaveImpressionOptions::new(1);
    boosted.priority = 5;
    backend.save_impression("a.example", None, boosted)?;
    clock.advance(Duration::from_secs(1));
    backend.save_impression("a.example", None, SaveImpressionOptions::new(2))?;
    clock.advance(Duration::from_secs(1));

    let report = backend.measure_conversion("a.example", None, conversion(5, 10))?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0, 10, 0, 0, 0]);
    Ok(())
}

#[test]
fn impressions_pool_across_epochs() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    backend.save_impression("a.example", None, SaveImpressionOptions::new(1))?;
    clock.advance(Duration::from_secs(7 * 86_400));
    backend.save_impression("a.example", None, SaveImpressionOptions::new(2))?;
    clock.advance(Duration::from_secs(1));

    let mut options = conversion(5, 4);
    options.credit = vec![1.0, 1.0];
    let report = backend.measure_conversion("a.example", None, options)?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0, 2, 2, 0, 0]);

    // Each contributing epoch paid for itself.
    assert_eq!(backend.privacy_budget_entries().len(), 2);
    Ok(())
}

#[test]
fn non_matching_impressions_do_not_affect_the_result() -> Result<(), anyhow::Error> {
    let run = |with_extra: bool| -> Result<Vec<u32>, anyhow::Error> {
        let (mut backend, clock) = backend();
        backend.save_impression("a.example", None, SaveImpressionOptions::new(3))?;
        if with_extra {
            let mut extra = SaveImpressionOptions::new(4);
            extra.conversion_sites = vec!["other.example".to_string()];
            backend.save_impression("a.example", None, extra)?;
        }
        clock.advance(Duration::from_secs(1));
        let report = backend.measure_conversion("a.example", None, conversion(5, 100))?;
        Ok(report.unencrypted_histogram.unwrap())
    };

    assert_eq!(run(false)?, run(true)?);
    Ok(())
}

#[test]
fn conversion_site_and_caller_constraints_apply() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    let mut constrained = SaveImpressionOptions::new(1);
    constrained.conversion_sites = vec!["shop.example".to_string()];
    constrained.conversion_callers = vec!["adtech.example".to_string()];
    backend.save_impression("pub.example", None, constrained)?;
    clock.advance(Duration::from_secs(1));

    // Conversion on the allowed site, but the caller defaults to the
    // top-level site, which is not an allowed caller.
    let report = backend.measure_conversion("shop.example", None, conversion(5, 10))?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0; 5]);

    // Measuring through the allowed intermediary caller attributes.
    let report = backend.measure_conversion(
        "shop.example",
        Some("adtech.example"),
        conversion(5, 10),
    )?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0, 10, 0, 0, 0]);
    Ok(())
}

#[test]
fn clearing_the_impression_site_restores_the_store() -> Result<(), anyhow::Error> {
    let (mut backend, _clock) = backend();

    backend.save_impression("a.example", None, SaveImpressionOptions::new(0))?;
    assert_eq!(backend.impressions().count(), 1);

    backend.clear_impressions_for_site("a.example")?;
    assert_eq!(backend.impressions().count(), 0);
    Ok(())
}

#[test]
fn stored_index_beyond_the_requested_size_contributes_nothing() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    backend.save_impression("a.example", None, SaveImpressionOptions::new(900))?;
    clock.advance(Duration::from_secs(1));

    let mut options = conversion(5, 100);
    options.lookback_days = Some(1);
    let report = backend.measure_conversion("a.example", None, options)?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0; 5]);

    // Single-epoch pricing charges the observed L1 norm, which is zero
    // here, so the cell still holds its full grace-extended capacity.
    let site = Site::parse("a.example").unwrap();
    let entry = &backend.privacy_budget_entries()[&(site, 0)];
    assert_eq!(entry.remaining_micro_epsilons(), 1_001_000);
    Ok(())
}

#[test]
fn single_epoch_queries_pay_the_observed_norm() -> Result<(), anyhow::Error> {
    let (mut backend, clock) = backend();

    backend.save_impression("a.example", None, SaveImpressionOptions::new(3))?;
    clock.advance(Duration::from_secs(1));

    let mut options = conversion(5, 100);
    options.lookback_days = Some(1);
    let report = backend.measure_conversion("a.example", None, options)?;
    assert_eq!(report.unencrypted_histogram.unwrap(), vec![0, 0, 0, 100, 0]);

    // L1 norm 100 against noise scale 200: half the epsilon of the
    // worst-case multi-epoch charge for the same query.
    let site = Site::parse("a.example").unwrap();
    let entry = &backend.privacy_budget_entries()[&(site, 0)];
    assert_eq!(entry.remaining_micro_epsilons(), 501_000);
    Ok(())
}
