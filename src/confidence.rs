// 🎯 Confidence Scorer - 0-100 trust score for a single observation
//
// Four independent signals, each in its own band:
//
//   source reliability     0-40   priority matrix score, rescaled
//   data freshness         0-20   step function of hours since the reading
//   measurement frequency  0-20   how regularly this source reports the metric
//   cross validation       0-20   agreement with other sources on the same day
//
// confidence = sum, capped at 100

use crate::category::CategoryTable;
use crate::observation::{ConfidenceFactors, Observation, ScoredObservation};
use crate::priority::PriorityMatrix;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;

/// Trailing window for the frequency factor (days, inclusive of the reading's own day)
pub const FREQUENCY_WINDOW_DAYS: i64 = 30;

/// Awarded when no other source reported the metric that day
pub const NEUTRAL_CROSS_VALIDATION: f64 = 10.0;

const ZERO_MEAN_EPSILON: f64 = 1e-9;

// ============================================================================
// STEP FUNCTIONS
// ============================================================================

/// Freshness band (0-20) for a reading `hours` old.
/// Readings dated in the future count as brand new.
pub fn freshness_score(hours: f64) -> f64 {
    let hours = hours.max(0.0);

    if hours < 1.0 {
        20.0
    } else if hours < 24.0 {
        18.0
    } else if hours < 72.0 {
        15.0
    } else if hours < 168.0 {
        10.0
    } else if hours < 720.0 {
        5.0
    } else {
        0.0
    }
}

/// Frequency band (0-20) for `count` readings in the trailing window
pub fn frequency_score(count: usize) -> f64 {
    match count {
        c if c >= 28 => 20.0, // daily
        c if c >= 12 => 15.0, // every other day
        c if c >= 4 => 10.0,  // weekly
        c if c >= 1 => 5.0,   // sparse
        _ => 0.0,
    }
}

/// Agreement band (0-20) for a mean absolute deviation expressed as a
/// percentage of the group mean
pub fn agreement_score(deviation_percent: f64) -> f64 {
    if deviation_percent < 2.0 {
        20.0
    } else if deviation_percent < 5.0 {
        15.0
    } else if deviation_percent < 10.0 {
        10.0
    } else if deviation_percent < 20.0 {
        5.0
    } else {
        0.0
    }
}

// ============================================================================
// CONFIDENCE SCORER
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    matrix: &'static PriorityMatrix,
    categories: Arc<CategoryTable>,
}

impl ConfidenceScorer {
    pub fn new() -> Self {
        ConfidenceScorer {
            matrix: PriorityMatrix::global(),
            categories: Arc::new(CategoryTable::new()),
        }
    }

    pub fn with_categories(categories: Arc<CategoryTable>) -> Self {
        ConfidenceScorer {
            matrix: PriorityMatrix::global(),
            categories,
        }
    }

    /// Score `observation` against every reading we know of for the same
    /// user and metric, evaluated now
    pub fn score(&self, observation: &Observation, all: &[Observation]) -> ScoredObservation {
        self.score_at(observation, all, Utc::now())
    }

    /// Same as `score`, with an explicit evaluation instant
    pub fn score_at(
        &self,
        observation: &Observation,
        all: &[Observation],
        now: DateTime<Utc>,
    ) -> ScoredObservation {
        let factors = ConfidenceFactors {
            source_reliability: self.source_reliability(observation),
            data_freshness: self.data_freshness(observation, now),
            measurement_frequency: self.measurement_frequency(observation, all),
            cross_validation: self.cross_validation(observation, all),
        };

        ScoredObservation::new(observation.clone(), factors)
    }

    /// Score every observation against the whole batch
    pub fn calculate_batch(&self, observations: &[Observation]) -> Vec<ScoredObservation> {
        self.calculate_batch_at(observations, Utc::now())
    }

    pub fn calculate_batch_at(
        &self,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> Vec<ScoredObservation> {
        self.calculate_batch_against_at(observations, observations, now)
    }

    /// Score every member of `group` against a wider `reference` set, e.g.
    /// one day's readings against the metric's whole history
    pub fn calculate_batch_against_at(
        &self,
        group: &[Observation],
        reference: &[Observation],
        now: DateTime<Utc>,
    ) -> Vec<ScoredObservation> {
        group
            .iter()
            .map(|obs| self.score_at(obs, reference, now))
            .collect()
    }

    // ========================================================================
    // FACTORS
    // ========================================================================

    /// priority / 10 * 40
    fn source_reliability(&self, observation: &Observation) -> f64 {
        let category = self.categories.categorize(&observation.metric_name);
        let priority = self.matrix.priority(observation.source, category);

        f64::from(priority) / 10.0 * 40.0
    }

    fn data_freshness(&self, observation: &Observation, now: DateTime<Utc>) -> f64 {
        let elapsed = now.signed_duration_since(observation.recorded_at);
        let hours = elapsed.num_seconds() as f64 / 3600.0;

        freshness_score(hours)
    }

    /// Same source, same metric, dated within the trailing window ending on
    /// the reading's own day. The reading itself always counts.
    fn measurement_frequency(&self, observation: &Observation, all: &[Observation]) -> f64 {
        let window_end = observation.measurement_date;
        let window_start = window_end
            .checked_sub_signed(Duration::days(FREQUENCY_WINDOW_DAYS))
            .unwrap_or(NaiveDate::MIN);

        let count = all
            .iter()
            .filter(|o| {
                o.user_id == observation.user_id
                    && o.source == observation.source
                    && o.metric_name == observation.metric_name
                    && o.measurement_date >= window_start
                    && o.measurement_date <= window_end
            })
            .count()
            .max(1);

        frequency_score(count)
    }

    /// Agreement with other sources' readings of the same metric on the same day
    fn cross_validation(&self, observation: &Observation, all: &[Observation]) -> f64 {
        let mut values = vec![observation.value];
        values.extend(
            all.iter()
                .filter(|o| {
                    o.user_id == observation.user_id
                        && o.source != observation.source
                        && o.shares_slot_with(observation)
                })
                .map(|o| o.value),
        );

        if values.len() < 2 {
            return NEUTRAL_CROSS_VALIDATION;
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let avg_deviation = values.iter().map(|v| (v - mean).abs()).sum::<f64>() / n;

        if mean.abs() < ZERO_MEAN_EPSILON {
            // Percentages are meaningless around zero: exact agreement or nothing
            return if avg_deviation < ZERO_MEAN_EPSILON { 20.0 } else { 0.0 };
        }

        agreement_score(avg_deviation / mean.abs() * 100.0)
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
