// 🔄 Unified Fetcher - Store → score → group → resolve
//
// One reconciled reading per metric per day. Nothing is cached between
// calls: identical store contents and evaluation instant give identical
// output.

use crate::config::ReconcilerConfig;
use crate::confidence::{ConfidenceScorer, FREQUENCY_WINDOW_DAYS};
use crate::observation::{DateRange, Observation, ScoredObservation};
use crate::resolver::{detect_outliers, strategy_for_metric, ConflictResolver, ResolutionConfig, ResolutionStrategy};
use crate::store::{MetricQuery, MetricStore};
use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// RECONCILED VALUE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledValue {
    pub metric_name: String,
    pub measurement_date: NaiveDate,

    /// The winning (or synthesized) reading with its confidence breakdown
    pub value: ScoredObservation,

    /// `None` when only one reading existed and no resolution ran
    pub strategy: Option<ResolutionStrategy>,

    /// Readings that competed for this slot
    pub candidate_count: usize,

    /// Ids of readings flagged by outlier detection (advisory)
    pub outlier_ids: Vec<String>,
}

impl ReconciledValue {
    pub fn was_conflict(&self) -> bool {
        self.candidate_count > 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    pub groups: usize,
    pub conflicts_resolved: usize,
    pub passthrough: usize,
    pub synthesized: usize,
    pub outliers_flagged: usize,
    pub average_confidence: f64,
}

impl ReconciliationSummary {
    pub fn from_values(values: &[ReconciledValue]) -> Self {
        let groups = values.len();
        let conflicts_resolved = values.iter().filter(|v| v.was_conflict()).count();

        let average_confidence = if groups == 0 {
            0.0
        } else {
            values.iter().map(|v| v.value.confidence).sum::<f64>() / groups as f64
        };

        ReconciliationSummary {
            groups,
            conflicts_resolved,
            passthrough: groups - conflicts_resolved,
            synthesized: values.iter().filter(|v| v.value.is_synthesized()).count(),
            outliers_flagged: values.iter().map(|v| v.outlier_ids.len()).sum(),
            average_confidence,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} slots: {} conflicts resolved, {} single-source, {} synthesized, {} outliers | avg confidence {:.1}",
            self.groups,
            self.conflicts_resolved,
            self.passthrough,
            self.synthesized,
            self.outliers_flagged,
            self.average_confidence
        )
    }
}

// ============================================================================
// UNIFIED FETCHER
// ============================================================================

pub struct UnifiedFetcher<S: MetricStore> {
    store: S,
    scorer: ConfidenceScorer,
    resolver: ConflictResolver,
    config: ReconcilerConfig,
}

impl<S: MetricStore> UnifiedFetcher<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, ReconcilerConfig::default())
    }

    pub fn with_config(store: S, config: ReconcilerConfig) -> Self {
        let categories = Arc::new(config.category_table());

        UnifiedFetcher {
            store,
            scorer: ConfidenceScorer::with_categories(categories.clone()),
            resolver: ConflictResolver::with_categories(categories),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Latest reconciled day for each metric (all metrics when `metric_names`
    /// is `None`), ordered by metric name
    pub fn reconcile_latest(
        &self,
        user_id: &str,
        metric_names: Option<&[String]>,
    ) -> Result<Vec<ReconciledValue>> {
        self.reconcile_latest_at(user_id, metric_names, Utc::now())
    }

    pub fn reconcile_latest_at(
        &self,
        user_id: &str,
        metric_names: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReconciledValue>> {
        let query = match metric_names {
            Some(names) => MetricQuery::metrics(names),
            None => MetricQuery::all(),
        };

        // Upstream failures propagate untouched
        let observations = self.store.fetch_observations(user_id, &query)?;

        let mut results = Vec::new();

        for (metric_name, history) in group_by_metric(observations) {
            let Some(latest_day) = history.iter().map(|o| o.measurement_date).max() else {
                continue;
            };

            let group: Vec<Observation> = history
                .iter()
                .filter(|o| o.measurement_date == latest_day)
                .cloned()
                .collect();
            let scored = self.scorer.calculate_batch_against_at(&group, &history, now);

            if let Some(value) =
                self.reconcile_group(&metric_name, latest_day, scored, self.config.latest_min_confidence)
            {
                results.push(value);
            }
        }

        let summary = ReconciliationSummary::from_values(&results);
        info!(user_id, "Reconciled latest values: {}", summary.summary());

        Ok(results)
    }

    /// Every reconciled day of `metric_name` inside `range`, newest first,
    /// at most one entry per date
    pub fn reconcile_history(
        &self,
        user_id: &str,
        metric_name: &str,
        range: DateRange,
    ) -> Result<Vec<ReconciledValue>> {
        self.reconcile_history_at(user_id, metric_name, range, Utc::now())
    }

    pub fn reconcile_history_at(
        &self,
        user_id: &str,
        metric_name: &str,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReconciledValue>> {
        // Readings before the range still count towards frequency scoring
        let scoring_range = DateRange {
            start: range
                .start
                .checked_sub_signed(Duration::days(FREQUENCY_WINDOW_DAYS))
                .unwrap_or(NaiveDate::MIN),
            end: range.end,
        };
        let query = MetricQuery::metrics(&[metric_name.to_string()]).with_range(scoring_range);

        let observations = self.store.fetch_observations(user_id, &query)?;

        let mut by_day: BTreeMap<NaiveDate, Vec<Observation>> = BTreeMap::new();
        for obs in observations.iter().filter(|o| range.contains(o.measurement_date)) {
            by_day.entry(obs.measurement_date).or_default().push(obs.clone());
        }

        let results: Vec<ReconciledValue> = by_day
            .into_iter()
            .rev()
            .filter_map(|(day, group)| {
                let scored = self.scorer.calculate_batch_against_at(&group, &observations, now);
                self.reconcile_group(metric_name, day, scored, self.config.history_min_confidence)
            })
            .collect();

        let summary = ReconciliationSummary::from_values(&results);
        info!(
            user_id,
            metric = metric_name,
            from = %range.start,
            to = %range.end,
            "Reconciled history: {}",
            summary.summary()
        );

        Ok(results)
    }

    /// Resolve one (metric, day) slot. Single readings pass through.
    fn reconcile_group(
        &self,
        metric_name: &str,
        day: NaiveDate,
        scored: Vec<ScoredObservation>,
        min_confidence: f64,
    ) -> Option<ReconciledValue> {
        let candidate_count = scored.len();

        if candidate_count == 1 {
            let value = scored.into_iter().next()?;
            return Some(ReconciledValue {
                metric_name: metric_name.to_string(),
                measurement_date: day,
                value,
                strategy: None,
                candidate_count,
                outlier_ids: Vec::new(),
            });
        }

        let outliers = detect_outliers(&scored, self.config.outlier_threshold_percent);
        for outlier in &outliers {
            warn!(
                metric = metric_name,
                date = %day,
                source = %outlier.source(),
                value = outlier.value(),
                "Outlier reading in conflict set"
            );
        }

        let strategy = strategy_for_metric(metric_name);
        let config = ResolutionConfig::with_threshold(strategy, min_confidence);
        let value = self.resolver.resolve(&scored, &config)?;

        Some(ReconciledValue {
            metric_name: metric_name.to_string(),
            measurement_date: day,
            value,
            strategy: Some(strategy),
            candidate_count,
            outlier_ids: outliers.iter().map(|o| o.id().to_string()).collect(),
        })
    }
}

fn group_by_metric(observations: Vec<Observation>) -> BTreeMap<String, Vec<Observation>> {
    let mut grouped: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for obs in observations {
        grouped.entry(obs.metric_name.clone()).or_default().push(obs);
    }
    grouped
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::MetricCategory;
    use crate::db::SqliteStore;
    use crate::observation::DataSource;
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 20, 20, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, day).unwrap()
    }

    fn obs(metric: &str, source: DataSource, value: f64, day: u32) -> Observation {
        Observation::new(
            "user-1",
            metric,
            source,
            value,
            "u",
            date(day),
            Utc.with_ymd_and_hms(2025, 7, day, 7, 0, 0).unwrap(),
        )
    }

    struct OfflineStore;

    impl MetricStore for OfflineStore {
        fn fetch_observations(&self, _user_id: &str, _query: &MetricQuery) -> Result<Vec<Observation>> {
            Err(anyhow!("metric service unreachable"))
        }
    }

    fn sample_store() -> MemoryStore {
        MemoryStore::from_observations(vec![
            // weight: scanner wins on priority
            obs("weight", DataSource::Withings, 72.6, 19),
            obs("weight", DataSource::Withings, 72.4, 20),
            obs("weight", DataSource::BodyScanner, 71.9, 20),
            // steps: weighted average
            obs("steps", DataSource::Garmin, 10_000.0, 20),
            obs("steps", DataSource::AppleHealth, 9_600.0, 20),
            // hrv: single reading passes through
            obs("hrv", DataSource::Whoop, 58.0, 18),
            // blood pressure: manual wins
            obs("systolic_bp", DataSource::Withings, 124.0, 20),
            obs("systolic_bp", DataSource::Manual, 119.0, 20),
        ])
    }

    #[test]
    fn test_reconcile_latest_one_value_per_metric() {
        let fetcher = UnifiedFetcher::new(sample_store());
        let results = fetcher.reconcile_latest_at("user-1", None, now()).unwrap();

        let names: Vec<&str> = results.iter().map(|r| r.metric_name.as_str()).collect();
        assert_eq!(names, vec!["hrv", "steps", "systolic_bp", "weight"]);

        let weight = &results[3];
        assert_eq!(weight.measurement_date, date(20));
        assert_eq!(weight.value.source(), DataSource::BodyScanner);
        assert_eq!(weight.strategy, Some(ResolutionStrategy::HighestPriority));
        assert_eq!(weight.candidate_count, 2);

        let steps = &results[1];
        assert_eq!(steps.strategy, Some(ResolutionStrategy::Average));
        assert_eq!(steps.value.source(), DataSource::Aggregate);
        assert!(steps.value.value() > 9_600.0 && steps.value.value() < 10_000.0);

        let hrv = &results[0];
        assert_eq!(hrv.strategy, None);
        assert_eq!(hrv.candidate_count, 1);
        assert_eq!(hrv.value.value(), 58.0);

        let bp = &results[2];
        assert_eq!(bp.strategy, Some(ResolutionStrategy::ManualOverride));
        assert_eq!(bp.value.source(), DataSource::Manual);
    }

    #[test]
    fn test_reconcile_latest_filters_metrics() {
        let fetcher = UnifiedFetcher::new(sample_store());
        let names = vec!["weight".to_string()];
        let results = fetcher.reconcile_latest_at("user-1", Some(names.as_slice()), now()).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metric_name, "weight");
    }

    #[test]
    fn test_reconcile_latest_unknown_user_is_empty() {
        let fetcher = UnifiedFetcher::new(sample_store());
        assert!(fetcher.reconcile_latest_at("nobody", None, now()).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_history_sorted_descending_one_per_day() {
        let store = MemoryStore::from_observations(vec![
            obs("sleep_duration", DataSource::Oura, 7.2, 15),
            obs("sleep_duration", DataSource::Whoop, 7.0, 15),
            obs("sleep_duration", DataSource::Oura, 6.8, 17),
            obs("sleep_duration", DataSource::Oura, 1.2, 17), // nap
            obs("sleep_duration", DataSource::Oura, 8.1, 16),
            obs("sleep_duration", DataSource::Oura, 5.0, 2), // outside range
        ]);
        let fetcher = UnifiedFetcher::new(store);
        let range = DateRange::new(date(10), date(20)).unwrap();

        let results = fetcher
            .reconcile_history_at("user-1", "sleep_duration", range, now())
            .unwrap();

        let dates: Vec<NaiveDate> = results.iter().map(|r| r.measurement_date).collect();
        assert_eq!(dates, vec![date(17), date(16), date(15)]);
        for pair in dates.windows(2) {
            assert!(pair[0] > pair[1]);
        }
        assert!(results.iter().all(|r| range.contains(r.measurement_date)));
    }

    #[test]
    fn test_history_counts_readings_before_range_for_frequency() {
        // Daily Withings for the 30 days before the range plus one inside it
        let mut readings: Vec<Observation> = (1..=19)
            .map(|d| obs("weight", DataSource::Withings, 72.0, d))
            .collect();
        readings.extend(
            (1..=30).map(|d| {
                let mut o = obs("weight", DataSource::Withings, 72.0, 1);
                o.measurement_date = date(1) - Duration::days(d);
                o.recorded_at = now() - Duration::days(20 + d);
                o
            }),
        );
        let fetcher = UnifiedFetcher::new(MemoryStore::from_observations(readings));
        let range = DateRange::new(date(19), date(19)).unwrap();

        let results = fetcher.reconcile_history_at("user-1", "weight", range, now()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value.factors.measurement_frequency, 20.0);
    }

    #[test]
    fn test_conflict_outliers_are_reported_not_removed() {
        let store = MemoryStore::from_observations(vec![
            obs("weight", DataSource::BodyScanner, 100.0, 20),
            obs("weight", DataSource::Withings, 102.0, 20),
            obs("weight", DataSource::AppleHealth, 98.0, 20),
            obs("weight", DataSource::Manual, 250.0, 20),
        ]);
        let manual_id = store
            .fetch_observations("user-1", &MetricQuery::all())
            .unwrap()
            .into_iter()
            .find(|o| o.source == DataSource::Manual)
            .unwrap()
            .id;

        let fetcher = UnifiedFetcher::new(store);
        let results = fetcher.reconcile_latest_at("user-1", None, now()).unwrap();

        assert_eq!(results[0].candidate_count, 4);
        assert_eq!(results[0].outlier_ids, vec![manual_id]);
        assert_eq!(results[0].value.source(), DataSource::BodyScanner);
    }

    #[test]
    fn test_upstream_error_propagates_unmodified() {
        let fetcher = UnifiedFetcher::new(OfflineStore);

        let err = fetcher.reconcile_latest_at("user-1", None, now()).unwrap_err();
        assert_eq!(err.to_string(), "metric service unreachable");

        let range = DateRange::new(date(1), date(2)).unwrap();
        let err = fetcher
            .reconcile_history_at("user-1", "weight", range, now())
            .unwrap_err();
        assert_eq!(err.to_string(), "metric service unreachable");
    }

    #[test]
    fn test_reconciliation_is_idempotent() {
        let fetcher = UnifiedFetcher::new(sample_store());
        let range = DateRange::new(date(1), date(31)).unwrap();

        let a = serde_json::to_string(&fetcher.reconcile_latest_at("user-1", None, now()).unwrap()).unwrap();
        let b = serde_json::to_string(&fetcher.reconcile_latest_at("user-1", None, now()).unwrap()).unwrap();
        assert_eq!(a, b);

        let h1 = serde_json::to_string(
            &fetcher.reconcile_history_at("user-1", "steps", range, now()).unwrap(),
        )
        .unwrap();
        let h2 = serde_json::to_string(
            &fetcher.reconcile_history_at("user-1", "steps", range, now()).unwrap(),
        )
        .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_configured_categories_reach_scoring() {
        let mut config = ReconcilerConfig::default();
        config
            .metric_categories
            .insert("vo2_max".to_string(), MetricCategory::Cardiovascular);

        let store = MemoryStore::from_observations(vec![obs("vo2_max", DataSource::Whoop, 51.0, 20)]);
        let fetcher = UnifiedFetcher::with_config(store, config);
        let results = fetcher.reconcile_latest_at("user-1", None, now()).unwrap();

        // Whoop is 9 for cardiovascular → 36
        assert_eq!(results[0].value.factors.source_reliability, 36.0);
    }

    #[test]
    fn test_summary() {
        let fetcher = UnifiedFetcher::new(sample_store());
        let results = fetcher.reconcile_latest_at("user-1", None, now()).unwrap();
        let summary = ReconciliationSummary::from_values(&results);

        assert_eq!(summary.groups, 4);
        assert_eq!(summary.conflicts_resolved, 3);
        assert_eq!(summary.passthrough, 1);
        assert_eq!(summary.synthesized, 1);
        assert!(!summary.summary().is_empty());

        assert_eq!(ReconciliationSummary::from_values(&[]).average_confidence, 0.0);
    }

    #[test]
    fn test_works_over_sqlite_store() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&[
                obs("weight", DataSource::Withings, 72.4, 20),
                obs("weight", DataSource::BodyScanner, 71.9, 20),
            ])
            .unwrap();

        let fetcher = UnifiedFetcher::new(store);
        let results = fetcher.reconcile_latest_at("user-1", None, now()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value.source(), DataSource::BodyScanner);
    }

    #[test]
    fn test_latest_and_history_use_their_own_confidence_floor() {
        let mut withings = obs("steps", DataSource::Withings, 9_000.0, 20);
        withings.recorded_at = now() - Duration::days(100);
        let mut manual = obs("steps", DataSource::Manual, 5_000.0, 20);
        manual.recorded_at = now() - Duration::days(100);

        let store = MemoryStore::from_observations(vec![
            obs("steps", DataSource::Garmin, 10_000.0, 20),
            withings,
            manual,
        ]);
        let fetcher = UnifiedFetcher::new(store);

        // Garmin 36+18+5+0, Withings 16+0+5+0, Manual 12+0+5+0
        let all = fetcher
            .store()
            .fetch_observations("user-1", &MetricQuery::all())
            .unwrap();
        let scored = ConfidenceScorer::new().calculate_batch_at(&all, now());
        let confidence = |source: DataSource| {
            scored.iter().find(|s| s.source() == source).unwrap().confidence
        };
        assert_eq!(confidence(DataSource::Garmin), 59.0);
        assert_eq!(confidence(DataSource::Withings), 21.0);
        assert_eq!(confidence(DataSource::Manual), 17.0);

        // Latest floor 30: Garmin alone
        let latest = fetcher.reconcile_latest_at("user-1", None, now()).unwrap();
        assert_eq!(latest[0].candidate_count, 3);
        assert_eq!(latest[0].value.value(), 10_000.0);

        // History floor 20: Garmin and Withings, (10000*59 + 9000*21) / 80
        let range = DateRange::new(date(1), date(31)).unwrap();
        let history = fetcher.reconcile_history_at("user-1", "steps", range, now()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value.value(), 9_737.5);
    }

    #[test]
    fn test_history_range_starting_at_min_date() {
        let fetcher = UnifiedFetcher::new(sample_store());
        let range = DateRange::new(NaiveDate::MIN, date(20)).unwrap();

        let results = fetcher.reconcile_history_at("user-1", "weight", range, now()).unwrap();
        let dates: Vec<NaiveDate> = results.iter().map(|r| r.measurement_date).collect();
        assert_eq!(dates, vec![date(20), date(19)]);
    }
}
