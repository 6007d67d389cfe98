// Metric Reconciliation - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod observation;  // Observations, sources, confidence factors
pub mod category;     // Metric name → category
pub mod priority;     // Priority Matrix
pub mod confidence;   // Confidence Scorer
pub mod resolver;     // Conflict Resolver + outlier detection
pub mod store;        // Raw metric store trait, memory + fan-out stores
pub mod db;           // SQLite raw metric store + CSV import
pub mod config;       // Reconciler configuration
pub mod fetcher;      // Unified Fetcher

// Re-export commonly used types
pub use observation::{
    ConfidenceFactors, DataSource, DateRange, Observation, ScoredObservation,
};
pub use category::{CategoryTable, MetricCategory};
pub use priority::{PriorityMatrix, DEFAULT_PRIORITY};
pub use confidence::{
    agreement_score, freshness_score, frequency_score, ConfidenceScorer,
};
pub use resolver::{
    detect_outliers, strategy_for_metric, ConflictResolver, ResolutionConfig,
    ResolutionStrategy, DEFAULT_OUTLIER_THRESHOLD_PERCENT,
};
pub use store::{FanOutStore, MemoryStore, MetricQuery, MetricStore};
pub use db::{
    get_observations, insert_observations, load_csv, setup_database, verify_count,
    ObservationRecord, SqliteStore,
};
pub use config::ReconcilerConfig;
pub use fetcher::{ReconciledValue, ReconciliationSummary, UnifiedFetcher};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the `tracing` subscriber used by the binaries.
/// `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
