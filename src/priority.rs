// 🥇 Priority Matrix - How much each device is trusted for each kind of metric
//
// Scores are 1-10 (10 = reference-grade for that category). The table is
// compiled-in configuration: there is no runtime mutation, so a single
// instance is shared read-only by every request.

use crate::category::MetricCategory;
use crate::observation::DataSource;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

/// Returned for pairs that have not been ranked
pub const DEFAULT_PRIORITY: u8 = 5;

/// (category, source, score)
const PRIORITY_TABLE: &[(MetricCategory, DataSource, u8)] = &[
    // Body composition: clinical scanner beats the bathroom scale
    (MetricCategory::BodyComposition, DataSource::BodyScanner, 10),
    (MetricCategory::BodyComposition, DataSource::Withings, 8),
    (MetricCategory::BodyComposition, DataSource::Manual, 6),
    (MetricCategory::BodyComposition, DataSource::AppleHealth, 5),
    (MetricCategory::BodyComposition, DataSource::Garmin, 4),
    (MetricCategory::BodyComposition, DataSource::Whoop, 3),
    // Activity
    (MetricCategory::Activity, DataSource::Garmin, 9),
    (MetricCategory::Activity, DataSource::AppleHealth, 8),
    (MetricCategory::Activity, DataSource::Whoop, 7),
    (MetricCategory::Activity, DataSource::Oura, 6),
    (MetricCategory::Activity, DataSource::Withings, 4),
    (MetricCategory::Activity, DataSource::Manual, 3),
    // Recovery
    (MetricCategory::Recovery, DataSource::Whoop, 10),
    (MetricCategory::Recovery, DataSource::Oura, 9),
    (MetricCategory::Recovery, DataSource::Garmin, 7),
    (MetricCategory::Recovery, DataSource::AppleHealth, 5),
    (MetricCategory::Recovery, DataSource::Manual, 2),
    // Cardiovascular
    (MetricCategory::Cardiovascular, DataSource::Whoop, 9),
    (MetricCategory::Cardiovascular, DataSource::Garmin, 8),
    (MetricCategory::Cardiovascular, DataSource::Oura, 8),
    (MetricCategory::Cardiovascular, DataSource::AppleHealth, 7),
    (MetricCategory::Cardiovascular, DataSource::Withings, 6),
    (MetricCategory::Cardiovascular, DataSource::Manual, 4),
    // Sleep
    (MetricCategory::Sleep, DataSource::Oura, 10),
    (MetricCategory::Sleep, DataSource::Whoop, 9),
    (MetricCategory::Sleep, DataSource::Garmin, 7),
    (MetricCategory::Sleep, DataSource::AppleHealth, 6),
    (MetricCategory::Sleep, DataSource::Withings, 5),
    (MetricCategory::Sleep, DataSource::Manual, 3),
    // General health: the user's own log is the best we have
    (MetricCategory::GeneralHealth, DataSource::Manual, 8),
    (MetricCategory::GeneralHealth, DataSource::AppleHealth, 7),
    (MetricCategory::GeneralHealth, DataSource::Withings, 6),
    (MetricCategory::GeneralHealth, DataSource::BodyScanner, 6),
    (MetricCategory::GeneralHealth, DataSource::Whoop, 5),
    (MetricCategory::GeneralHealth, DataSource::Oura, 5),
    (MetricCategory::GeneralHealth, DataSource::Garmin, 5),
];

// ============================================================================
// PRIORITY MATRIX
// ============================================================================

#[derive(Debug, Clone)]
pub struct PriorityMatrix {
    scores: HashMap<(DataSource, MetricCategory), u8>,
}

impl PriorityMatrix {
    pub fn new() -> Self {
        let scores = PRIORITY_TABLE
            .iter()
            .map(|&(category, source, score)| ((source, category), score))
            .collect();

        PriorityMatrix { scores }
    }

    /// Shared instance
    pub fn global() -> &'static PriorityMatrix {
        static MATRIX: OnceLock<PriorityMatrix> = OnceLock::new();
        MATRIX.get_or_init(PriorityMatrix::new)
    }

    /// Reliability of `source` for `category`, 1-10.
    ///
    /// Unranked pairs get `DEFAULT_PRIORITY` so a newly connected device
    /// never breaks resolution.
    pub fn priority(&self, source: DataSource, category: MetricCategory) -> u8 {
        match self.scores.get(&(source, category)) {
            Some(score) => *score,
            None => {
                warn!(
                    source = %source,
                    category = %category,
                    "No priority ranking for source/category, using default {}",
                    DEFAULT_PRIORITY
                );
                DEFAULT_PRIORITY
            }
        }
    }

    /// Explicit entry only, no default
    pub fn explicit_priority(&self, source: DataSource, category: MetricCategory) -> Option<u8> {
        self.scores.get(&(source, category)).copied()
    }

    /// Sort comparator: higher priority first (`Less` means `a` sorts before `b`)
    pub fn compare(&self, a: DataSource, b: DataSource, category: MetricCategory) -> Ordering {
        self.priority(b, category).cmp(&self.priority(a, category))
    }

    /// Sources with an explicit entry for `category`, best first.
    /// Equal scores keep declaration order.
    pub fn ranked_sources(&self, category: MetricCategory) -> Vec<DataSource> {
        let mut ranked: Vec<(DataSource, u8)> = DataSource::REAL
            .iter()
            .filter_map(|s| self.explicit_priority(*s, category).map(|p| (*s, p)))
            .collect();

        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().map(|(s, _)| s).collect()
    }
}

impl Default for PriorityMatrix {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
