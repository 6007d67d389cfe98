// 🏷️ Metric Categories - Which row of the priority matrix applies
//
// Categories are never stored. They are derived from the metric name:
// first from an explicit table (if configured), then by keyword rules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// METRIC CATEGORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    BodyComposition,
    Activity,
    Recovery,
    Cardiovascular,
    Sleep,
    GeneralHealth,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 6] = [
        MetricCategory::BodyComposition,
        MetricCategory::Activity,
        MetricCategory::Recovery,
        MetricCategory::Cardiovascular,
        MetricCategory::Sleep,
        MetricCategory::GeneralHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricCategory::BodyComposition => "body_composition",
            MetricCategory::Activity => "activity",
            MetricCategory::Recovery => "recovery",
            MetricCategory::Cardiovascular => "cardiovascular",
            MetricCategory::Sleep => "sleep",
            MetricCategory::GeneralHealth => "general_health",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
        MetricCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
    }

    /// Keyword classification of a metric name.
    ///
    /// Rules are checked in order; the first hit wins. Unmatched names are
    /// general health.
    pub fn infer(metric_name: &str) -> Self {
        let name = metric_name.to_lowercase();

        KEYWORD_RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| name.contains(k)))
            .map(|(_, category)| *category)
            .unwrap_or(MetricCategory::GeneralHealth)
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order matters: "hrv" must be claimed by recovery before "hr" reaches
/// cardiovascular.
const KEYWORD_RULES: [(&[&str], MetricCategory); 5] = [
    (&["weight", "fat", "muscle", "bmr", "bmi"], MetricCategory::BodyComposition),
    (&["step", "calories", "active"], MetricCategory::Activity),
    (&["recovery", "hrv"], MetricCategory::Recovery),
    (&["heart", "hr"], MetricCategory::Cardiovascular),
    (&["sleep"], MetricCategory::Sleep),
];

// ============================================================================
// CATEGORY TABLE
// ============================================================================

/// Explicit metric → category assignments, consulted before keyword rules.
///
/// Lets a deployment pin metrics whose names would be misclassified by
/// substring matching (e.g. "chest_circumference" would otherwise be general
/// health, "threshold_pace" would hit "hr").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryTable {
    entries: HashMap<String, MetricCategory>,
}

impl CategoryTable {
    pub fn new() -> Self {
        CategoryTable::default()
    }

    pub fn from_entries(entries: HashMap<String, MetricCategory>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(name, category)| (name.to_lowercase(), category))
            .collect();
        CategoryTable { entries }
    }

    pub fn insert(&mut self, metric_name: &str, category: MetricCategory) {
        self.entries.insert(metric_name.to_lowercase(), category);
    }

    pub fn categorize(&self, metric_name: &str) -> MetricCategory {
        self.entries
            .get(&metric_name.to_lowercase())
            .copied()
            .unwrap_or_else(|| MetricCategory::infer(metric_name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_body_composition() {
        assert_eq!(MetricCategory::infer("weight"), MetricCategory::BodyComposition);
        assert_eq!(MetricCategory::infer("body_fat_percentage"), MetricCategory::BodyComposition);
        assert_eq!(MetricCategory::infer("Muscle_Mass"), MetricCategory::BodyComposition);
        assert_eq!(MetricCategory::infer("BMR"), MetricCategory::BodyComposition);
    }

    #[test]
    fn test_infer_other_families() {
        assert_eq!(MetricCategory::infer("steps"), MetricCategory::Activity);
        assert_eq!(MetricCategory::infer("active_calories"), MetricCategory::Activity);
        assert_eq!(MetricCategory::infer("HRV_rmssd"), MetricCategory::Recovery);
        assert_eq!(MetricCategory::infer("recovery_score"), MetricCategory::Recovery);
        assert_eq!(MetricCategory::infer("resting_heart_rate"), MetricCategory::Cardiovascular);
        assert_eq!(MetricCategory::infer("max_hr"), MetricCategory::Cardiovascular);
        assert_eq!(MetricCategory::infer("sleep_duration"), MetricCategory::Sleep);
    }

    #[test]
    fn test_unmatched_falls_back_to_general_health() {
        assert_eq!(MetricCategory::infer("blood_glucose"), MetricCategory::GeneralHealth);
        assert_eq!(MetricCategory::infer(""), MetricCategory::GeneralHealth);
    }

    #[test]
    fn test_table_overrides_keywords() {
        let mut table = CategoryTable::new();
        table.insert("Threshold_Pace", MetricCategory::Activity);

        // "threshold" contains "hr"
        assert_eq!(MetricCategory::infer("threshold_pace"), MetricCategory::Cardiovascular);
        assert_eq!(table.categorize("threshold_pace"), MetricCategory::Activity);

        // Unknown names still use keyword rules
        assert_eq!(table.categorize("weight"), MetricCategory::BodyComposition);
        assert_eq!(table.categorize("vo2_max"), MetricCategory::GeneralHealth);
    }

    #[test]
    fn test_parse_category() {
        assert_eq!(MetricCategory::parse("Body Composition"), Some(MetricCategory::BodyComposition));
        assert_eq!(MetricCategory::parse("sleep"), Some(MetricCategory::Sleep));
        assert_eq!(MetricCategory::parse("nutrition"), None);
    }
}
