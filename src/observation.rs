// 📏 Observations - One reading, one metric, one source, one day
//
// Everything the reconciliation core consumes and produces is built from
// these records. Units are normalized upstream; this module never converts.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================================
// DATA SOURCE
// ============================================================================

/// Device or service that reported a value.
///
/// `Aggregate` is never a real device: it tags values synthesized by the
/// resolver (weighted averages, even-sized medians) so downstream code can
/// tell them apart without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Professional body-composition scanner (clinic / gym 3D scan)
    BodyScanner,

    /// Withings smart scale
    Withings,

    /// Whoop strap
    Whoop,

    /// Oura ring
    Oura,

    /// Garmin watch
    Garmin,

    /// Apple Health (third-party aggregator of other devices)
    AppleHealth,

    /// Typed in by the user
    Manual,

    /// Synthesized by the resolver
    Aggregate,
}

impl DataSource {
    /// Every real (non-synthetic) source, in declaration order
    pub const REAL: [DataSource; 7] = [
        DataSource::BodyScanner,
        DataSource::Withings,
        DataSource::Whoop,
        DataSource::Oura,
        DataSource::Garmin,
        DataSource::AppleHealth,
        DataSource::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::BodyScanner => "body_scanner",
            DataSource::Withings => "withings",
            DataSource::Whoop => "whoop",
            DataSource::Oura => "oura",
            DataSource::Garmin => "garmin",
            DataSource::AppleHealth => "apple_health",
            DataSource::Manual => "manual",
            DataSource::Aggregate => "aggregate",
        }
    }

    /// Parse a source name as it appears in imports and API requests.
    ///
    /// Case-insensitive; spaces and dashes are treated as underscores.
    pub fn parse(name: &str) -> Result<Self> {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");

        let source = match normalized.as_str() {
            "body_scanner" | "bodyscanner" | "scanner" | "dexa" | "styku" => DataSource::BodyScanner,
            "withings" | "smart_scale" | "scale" => DataSource::Withings,
            "whoop" => DataSource::Whoop,
            "oura" | "oura_ring" => DataSource::Oura,
            "garmin" => DataSource::Garmin,
            "apple_health" | "applehealth" | "healthkit" => DataSource::AppleHealth,
            "manual" | "manual_entry" | "user" => DataSource::Manual,
            "aggregate" | "aggregated" => DataSource::Aggregate,
            _ => bail!("Unknown data source: {}", name),
        };

        Ok(source)
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, DataSource::Manual)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, DataSource::Aggregate)
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// OBSERVATION
// ============================================================================

/// A single source-attributed reading of one metric on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Stable identity (UUID)
    pub id: String,

    pub user_id: String,

    /// Physiological quantity, e.g. "weight", "sleep_duration"
    pub metric_name: String,

    pub source: DataSource,

    pub value: f64,

    /// Already normalized upstream
    pub unit: String,

    /// Calendar day the reading belongs to (conflict grouping key)
    pub measurement_date: NaiveDate,

    /// When the reading was taken / observed (freshness only)
    pub recorded_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        user_id: &str,
        metric_name: &str,
        source: DataSource,
        value: f64,
        unit: &str,
        measurement_date: NaiveDate,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Observation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            metric_name: metric_name.to_string(),
            source,
            value,
            unit: unit.to_string(),
            measurement_date,
            recorded_at,
        }
    }

    /// Hash used to skip re-imports of the same reading.
    /// NOTE: this is for DEDUPLICATION, identity is `id`.
    pub fn idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}",
            self.user_id,
            self.metric_name,
            self.source,
            self.measurement_date,
            self.value,
            self.recorded_at.to_rfc3339()
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Same metric, same calendar day
    pub fn shares_slot_with(&self, other: &Observation) -> bool {
        self.metric_name == other.metric_name && self.measurement_date == other.measurement_date
    }
}

// ============================================================================
// CONFIDENCE
// ============================================================================

/// Four independently bounded sub-scores.
///
/// | factor                | band    |
/// |-----------------------|---------|
/// | source_reliability    | 0..=40  |
/// | data_freshness        | 0..=20  |
/// | measurement_frequency | 0..=20  |
/// | cross_validation      | 0..=20  |
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub source_reliability: f64,
    pub data_freshness: f64,
    pub measurement_frequency: f64,
    pub cross_validation: f64,
}

impl ConfidenceFactors {
    pub const MAX_CONFIDENCE: f64 = 100.0;

    /// Sum of the factors, capped at 100
    pub fn total(&self) -> f64 {
        let sum = self.source_reliability
            + self.data_freshness
            + self.measurement_frequency
            + self.cross_validation;

        sum.min(Self::MAX_CONFIDENCE)
    }
}

/// An observation paired with its trust score. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredObservation {
    #[serde(flatten)]
    pub observation: Observation,

    /// 0-100
    pub confidence: f64,

    pub factors: ConfidenceFactors,
}

impl ScoredObservation {
    pub fn new(observation: Observation, factors: ConfidenceFactors) -> Self {
        ScoredObservation {
            confidence: factors.total(),
            observation,
            factors,
        }
    }

    pub fn value(&self) -> f64 {
        self.observation.value
    }

    pub fn source(&self) -> DataSource {
        self.observation.source
    }

    pub fn metric_name(&self) -> &str {
        &self.observation.metric_name
    }

    pub fn measurement_date(&self) -> NaiveDate {
        self.observation.measurement_date
    }

    pub fn id(&self) -> &str {
        &self.observation.id
    }

    /// True when the value was synthesized rather than device-reported
    pub fn is_synthesized(&self) -> bool {
        self.observation.source.is_aggregate()
    }
}

// ============================================================================
// DATE RANGE
// ============================================================================

/// Inclusive calendar range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            bail!("Invalid date range: {} is after {}", start, end);
        }
        Ok(DateRange { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

// ============================================================================
// TESTS
// ============================================================================
