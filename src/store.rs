// 📦 Raw Metric Stores - Where observations come from
//
// The reconciliation core only needs "give me this user's readings".
// Stores never score or resolve; errors come back untouched so the caller
// owns retry policy.

use crate::observation::{DateRange, Observation};
use anyhow::Result;
use std::sync::RwLock;
use tracing::debug;

// ============================================================================
// QUERY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricQuery {
    /// `None` = every metric
    pub metric_names: Option<Vec<String>>,

    /// `None` = all dates
    pub date_range: Option<DateRange>,
}

impl MetricQuery {
    pub fn all() -> Self {
        MetricQuery::default()
    }

    pub fn metrics(names: &[String]) -> Self {
        MetricQuery {
            metric_names: Some(names.to_vec()),
            date_range: None,
        }
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn matches(&self, observation: &Observation) -> bool {
        let metric_ok = match &self.metric_names {
            Some(names) => names.iter().any(|n| *n == observation.metric_name),
            None => true,
        };

        let date_ok = match &self.date_range {
            Some(range) => range.contains(observation.measurement_date),
            None => true,
        };

        metric_ok && date_ok
    }
}

// ============================================================================
// METRIC STORE
// ============================================================================

/// Supplies already-normalized observations for one user
pub trait MetricStore: Send + Sync {
    fn fetch_observations(&self, user_id: &str, query: &MetricQuery) -> Result<Vec<Observation>>;
}

impl<S: MetricStore + ?Sized> MetricStore for Box<S> {
    fn fetch_observations(&self, user_id: &str, query: &MetricQuery) -> Result<Vec<Observation>> {
        (**self).fetch_observations(user_id, query)
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    observations: RwLock<Vec<Observation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn from_observations(observations: Vec<Observation>) -> Self {
        MemoryStore {
            observations: RwLock::new(observations),
        }
    }

    pub fn add(&self, observation: Observation) {
        self.observations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observation);
    }

    pub fn len(&self) -> usize {
        self.observations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricStore for MemoryStore {
    fn fetch_observations(&self, user_id: &str, query: &MetricQuery) -> Result<Vec<Observation>> {
        let observations = self
            .observations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(observations
            .iter()
            .filter(|o| o.user_id == user_id && query.matches(o))
            .cloned()
            .collect())
    }
}

// ============================================================================
// FAN-OUT STORE
// ============================================================================

/// Several partitions (per-source tables, vendor caches, ...) queried as one.
///
/// Every partition must answer before anything is returned: scoring needs
/// the complete candidate set. The first partition error is returned as-is.
pub struct FanOutStore {
    partitions: Vec<Box<dyn MetricStore>>,
}

impl FanOutStore {
    pub fn new() -> Self {
        FanOutStore {
            partitions: Vec::new(),
        }
    }

    pub fn with_partition(mut self, partition: Box<dyn MetricStore>) -> Self {
        self.partitions.push(partition);
        self
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    #[cfg(feature = "parallel")]
    fn fetch_all(&self, user_id: &str, query: &MetricQuery) -> Vec<Result<Vec<Observation>>> {
        use rayon::prelude::*;

        self.partitions
            .par_iter()
            .map(|p| p.fetch_observations(user_id, query))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn fetch_all(&self, user_id: &str, query: &MetricQuery) -> Vec<Result<Vec<Observation>>> {
        self.partitions
            .iter()
            .map(|p| p.fetch_observations(user_id, query))
            .collect()
    }
}

impl Default for FanOutStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore for FanOutStore {
    fn fetch_observations(&self, user_id: &str, query: &MetricQuery) -> Result<Vec<Observation>> {
        let mut joined = Vec::new();

        // Results come back in partition order regardless of completion order
        for result in self.fetch_all(user_id, query) {
            joined.extend(result?);
        }

        debug!(
            user_id,
            partitions = self.partitions.len(),
            observations = joined.len(),
            "Joined partition fetches"
        );

        Ok(joined)
    }
}

// ============================================================================
// TESTS
// ============================================================================
