// ⚖️ Conflict Resolver - One value per metric per day
//
// Input: every scored reading that shares (metric_name, measurement_date)
// for one user. Output: the reading the rest of the system should treat as
// ground truth, or a synthesized one tagged with the aggregate source.
//
// The resolver executes whatever strategy it is given. Which strategy fits
// which metric family lives in `strategy_for_metric`, not in here.

use crate::category::CategoryTable;
use crate::observation::{DataSource, ScoredObservation};
use crate::priority::PriorityMatrix;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default allowed deviation for `detect_outliers` (percent)
pub const DEFAULT_OUTLIER_THRESHOLD_PERCENT: f64 = 15.0;

const EPSILON: f64 = 1e-9;

// ============================================================================
// RESOLUTION STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Greatest confidence; first encountered wins ties
    HighestConfidence,

    /// Priority matrix score, then the tie-break chain
    HighestPriority,

    /// Confidence-weighted mean, tagged as aggregate
    Average,

    /// Middle value; even-sized sets average the two middle readings
    Median,

    /// Latest measurement date
    MostRecent,

    /// Manual entry if present, else highest confidence
    ManualOverride,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::HighestConfidence => "highest_confidence",
            ResolutionStrategy::HighestPriority => "highest_priority",
            ResolutionStrategy::Average => "average",
            ResolutionStrategy::Median => "median",
            ResolutionStrategy::MostRecent => "most_recent",
            ResolutionStrategy::ManualOverride => "manual_override",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric family → strategy. First matching row wins; everything else is
/// `ManualOverride`.
const STRATEGY_TABLE: [(&[&str], ResolutionStrategy); 3] = [
    (&["weight", "fat", "muscle"], ResolutionStrategy::HighestPriority),
    (&["step", "calories", "active"], ResolutionStrategy::Average),
    (&["hrv", "recovery", "resting"], ResolutionStrategy::HighestConfidence),
];

/// Per-family resolution policy (case-insensitive keyword match)
pub fn strategy_for_metric(metric_name: &str) -> ResolutionStrategy {
    let name = metric_name.to_lowercase();

    STRATEGY_TABLE
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| name.contains(k)))
        .map(|(_, strategy)| *strategy)
        .unwrap_or(ResolutionStrategy::ManualOverride)
}

// ============================================================================
// RESOLUTION CONFIG
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    pub strategy: ResolutionStrategy,

    /// Members below this confidence are dropped before the strategy runs
    /// (unless that would drop everyone)
    pub min_confidence_threshold: Option<f64>,
}

impl ResolutionConfig {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        ResolutionConfig {
            strategy,
            min_confidence_threshold: None,
        }
    }

    pub fn with_threshold(strategy: ResolutionStrategy, threshold: f64) -> Self {
        ResolutionConfig {
            strategy,
            min_confidence_threshold: Some(threshold),
        }
    }
}

// ============================================================================
// CONFLICT RESOLVER
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    matrix: &'static PriorityMatrix,
    categories: Arc<CategoryTable>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        ConflictResolver {
            matrix: PriorityMatrix::global(),
            categories: Arc::new(CategoryTable::new()),
        }
    }

    pub fn with_categories(categories: Arc<CategoryTable>) -> Self {
        ConflictResolver {
            matrix: PriorityMatrix::global(),
            categories,
        }
    }

    /// Pick (or synthesize) the winning reading. `None` only for an empty set.
    pub fn resolve(
        &self,
        conflict_set: &[ScoredObservation],
        config: &ResolutionConfig,
    ) -> Option<ScoredObservation> {
        if conflict_set.is_empty() {
            return None;
        }

        let candidates = self.apply_threshold(conflict_set, config.min_confidence_threshold);

        let resolved = match config.strategy {
            ResolutionStrategy::HighestConfidence => highest_confidence(&candidates).clone(),
            ResolutionStrategy::HighestPriority => self.highest_priority(&candidates).clone(),
            ResolutionStrategy::Average => weighted_average(&candidates),
            ResolutionStrategy::Median => median(&candidates),
            ResolutionStrategy::MostRecent => most_recent(&candidates).clone(),
            ResolutionStrategy::ManualOverride => {
                // Manual entries bypass the confidence floor: the user said so
                match conflict_set.iter().find(|o| o.source().is_manual()) {
                    Some(manual) => manual.clone(),
                    None => highest_confidence(&candidates).clone(),
                }
            }
        };

        debug!(
            metric = %resolved.metric_name(),
            date = %resolved.measurement_date(),
            strategy = %config.strategy,
            candidates = candidates.len(),
            winner = %resolved.source(),
            value = resolved.value(),
            "Resolved conflict set"
        );

        Some(resolved)
    }

    /// Drop low-confidence members; fall back to the unfiltered set if
    /// nothing survives
    fn apply_threshold<'a>(
        &self,
        conflict_set: &'a [ScoredObservation],
        threshold: Option<f64>,
    ) -> Vec<&'a ScoredObservation> {
        let all: Vec<&ScoredObservation> = conflict_set.iter().collect();

        let Some(threshold) = threshold else {
            return all;
        };

        let filtered: Vec<&ScoredObservation> = conflict_set
            .iter()
            .filter(|o| o.confidence >= threshold)
            .collect();

        if filtered.is_empty() {
            warn!(
                metric = %conflict_set[0].metric_name(),
                date = %conflict_set[0].measurement_date(),
                threshold,
                members = conflict_set.len(),
                "No observation meets the confidence threshold, resolving over the unfiltered set"
            );
            return all;
        }

        filtered
    }

    fn highest_priority<'a>(&self, candidates: &[&'a ScoredObservation]) -> &'a ScoredObservation {
        let mut best = candidates[0];
        for &candidate in &candidates[1..] {
            if self.priority_order(candidate, best) == Ordering::Greater {
                best = candidate;
            }
        }
        best
    }

    /// `Greater` when `a` should win over `b`.
    ///
    /// Priority first. On equal priority: larger value for main-sleep
    /// duration / efficiency metrics, then confidence, then latest date.
    fn priority_order(&self, a: &ScoredObservation, b: &ScoredObservation) -> Ordering {
        let category = self.categories.categorize(a.metric_name());
        let pa = self.matrix.priority(a.source(), category);
        let pb = self.matrix.priority(b.source(), category);

        pa.cmp(&pb)
            .then_with(|| {
                if prefers_larger_value(a.metric_name()) {
                    a.value().total_cmp(&b.value())
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| a.confidence.total_cmp(&b.confidence))
            .then_with(|| a.measurement_date().cmp(&b.measurement_date()))
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep duration and efficiency: a nap or partial night reads lower than
/// the main sleep segment
fn prefers_larger_value(metric_name: &str) -> bool {
    let name = metric_name.to_lowercase();
    name.contains("sleep") && (name.contains("duration") || name.contains("efficiency"))
}

// ============================================================================
// STRATEGIES
// ============================================================================

fn highest_confidence<'a>(candidates: &[&'a ScoredObservation]) -> &'a ScoredObservation {
    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        if candidate.confidence > best.confidence {
            best = candidate;
        }
    }
    best
}

fn most_recent<'a>(candidates: &[&'a ScoredObservation]) -> &'a ScoredObservation {
    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        let newer = (candidate.measurement_date(), candidate.observation.recorded_at)
            > (best.measurement_date(), best.observation.recorded_at);
        if newer {
            best = candidate;
        }
    }
    best
}

/// Σ(value·confidence) / Σ(confidence), rounded to 2 decimals.
///
/// Metadata and factors come from the highest-confidence member; the source
/// becomes `Aggregate`.
fn weighted_average(candidates: &[&ScoredObservation]) -> ScoredObservation {
    let total_weight: f64 = candidates.iter().map(|o| o.confidence).sum();

    let mean = if total_weight > EPSILON {
        candidates.iter().map(|o| o.value() * o.confidence).sum::<f64>() / total_weight
    } else {
        // All zero confidence: every member counts the same
        candidates.iter().map(|o| o.value()).sum::<f64>() / candidates.len() as f64
    };

    let mut synthesized = highest_confidence(candidates).clone();
    synthesized.observation.id = format!(
        "aggregate:{}:{}",
        synthesized.metric_name(),
        synthesized.measurement_date()
    );
    synthesized.observation.source = DataSource::Aggregate;
    synthesized.observation.value = round2(mean);
    synthesized
}

fn median(candidates: &[&ScoredObservation]) -> ScoredObservation {
    let mut sorted: Vec<&ScoredObservation> = candidates.to_vec();
    sorted.sort_by(|a, b| a.value().total_cmp(&b.value()));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid].clone()
    } else {
        // Each middle reading keeps its own weight
        weighted_average(&sorted[mid - 1..=mid])
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// OUTLIER DETECTION
// ============================================================================

/// Members whose value deviates from the group's center by more than
/// `allowed_deviation_percent`.
///
/// The center is the median, not the group mean. With a mean center one
/// wild reading drags the reference toward itself: for
/// `[100, 102, 98, 250]` the mean is 137.5 and every member deviates by
/// more than 15%, while the median (101) flags only 250. Advisory only:
/// nothing is removed.
pub fn detect_outliers(
    scored_set: &[ScoredObservation],
    allowed_deviation_percent: f64,
) -> Vec<ScoredObservation> {
    if scored_set.len() < 2 {
        return Vec::new();
    }

    let mut values: Vec<f64> = scored_set.iter().map(|o| o.value()).collect();
    values.sort_by(f64::total_cmp);

    let mid = values.len() / 2;
    let center = if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    };

    if center.abs() < EPSILON {
        return Vec::new();
    }

    scored_set
        .iter()
        .filter(|o| (o.value() - center).abs() / center.abs() * 100.0 > allowed_deviation_percent)
        .cloned()
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
