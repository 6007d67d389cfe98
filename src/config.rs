// ⚙️ Reconciler Configuration - Thresholds and paths as data
//
// Loaded from a JSON file (same format family as the rest of our config),
// every field optional. Environment variables only pick the file and the
// database path.

use crate::category::{CategoryTable, MetricCategory};
use crate::resolver::DEFAULT_OUTLIER_THRESHOLD_PERCENT;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path of the JSON config file
pub const CONFIG_ENV: &str = "METRIC_RECONCILER_CONFIG";

/// Overrides `database_path`
pub const DATABASE_ENV: &str = "METRIC_RECONCILER_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Confidence floor for "latest value" queries
    pub latest_min_confidence: f64,

    /// Confidence floor for history queries (lower: old devices lose freshness)
    pub history_min_confidence: f64,

    /// Allowed deviation before a reading is reported as an outlier (percent)
    pub outlier_threshold_percent: f64,

    pub database_path: PathBuf,

    /// Upper bound on one fetch from the raw metric store
    pub fetch_timeout_secs: u64,

    /// Explicit metric → category assignments (checked before keyword rules)
    pub metric_categories: HashMap<String, MetricCategory>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            latest_min_confidence: 30.0,
            history_min_confidence: 20.0,
            outlier_threshold_percent: DEFAULT_OUTLIER_THRESHOLD_PERCENT,
            database_path: PathBuf::from("metrics.db"),
            fetch_timeout_secs: 10,
            metric_categories: HashMap::new(),
        }
    }
}

impl ReconcilerConfig {
    /// Load config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse config JSON")
    }

    /// File named by `METRIC_RECONCILER_CONFIG` (defaults if unset), then
    /// `METRIC_RECONCILER_DB`
    pub fn load() -> Result<Self> {
        let mut config = match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(db_path) = env::var(DATABASE_ENV) {
            config.database_path = PathBuf::from(db_path);
        }

        Ok(config)
    }

    pub fn category_table(&self) -> CategoryTable {
        CategoryTable::from_entries(self.metric_categories.clone())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================
