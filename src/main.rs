use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::env;
use std::path::Path;

// Use library instead of local modules
use metric_reconciliation::{
    init_logging, load_csv, DateRange, MetricCategory, PriorityMatrix, ReconcilerConfig,
    ReconciliationSummary, SqliteStore, UnifiedFetcher,
};

const USAGE: &str = "Usage:
  metric-reconcile import <csv>
  metric-reconcile latest <user_id> [metric ...]
  metric-reconcile history <user_id> <metric> <from YYYY-MM-DD> <to YYYY-MM-DD>
  metric-reconcile priorities <category>";

fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let config = ReconcilerConfig::load()?;

    match args.get(1).map(String::as_str) {
        Some("import") => run_import(&config, &args[2..]),
        Some("latest") => run_latest(&config, &args[2..]),
        Some("history") => run_history(&config, &args[2..]),
        Some("priorities") => run_priorities(&args[2..]),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn open_store(config: &ReconcilerConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database_path, config.fetch_timeout())
}

fn run_import(config: &ReconcilerConfig, args: &[String]) -> Result<()> {
    let Some(csv_path) = args.first() else {
        bail!("import needs a CSV path\n{}", USAGE);
    };

    println!("📂 Loading {}...", csv_path);
    let observations = load_csv(Path::new(csv_path))?;
    println!("✓ Loaded {} observations from CSV", observations.len());

    let store = open_store(config)?;
    let inserted = store.insert(&observations)?;
    let total = store.count()?;

    println!("✓ Inserted: {} new observations", inserted);
    println!("✓ Skipped duplicates: {}", observations.len() - inserted);
    println!("✓ Database contains {} observations", total);

    Ok(())
}

fn run_latest(config: &ReconcilerConfig, args: &[String]) -> Result<()> {
    let Some(user_id) = args.first() else {
        bail!("latest needs a user id\n{}", USAGE);
    };
    let metrics = &args[1..];

    let fetcher = UnifiedFetcher::with_config(open_store(config)?, config.clone());
    let filter = if metrics.is_empty() { None } else { Some(metrics) };
    let results = fetcher.reconcile_latest(user_id, filter)?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    eprintln!("{}", ReconciliationSummary::from_values(&results).summary());

    Ok(())
}

fn run_history(config: &ReconcilerConfig, args: &[String]) -> Result<()> {
    let [user_id, metric, from, to] = args else {
        bail!("history needs <user_id> <metric> <from> <to>\n{}", USAGE);
    };

    let range = DateRange::new(parse_date(from)?, parse_date(to)?)?;

    let fetcher = UnifiedFetcher::with_config(open_store(config)?, config.clone());
    let results = fetcher.reconcile_history(user_id, metric, range)?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    eprintln!("{}", ReconciliationSummary::from_values(&results).summary());

    Ok(())
}

fn run_priorities(args: &[String]) -> Result<()> {
    let Some(name) = args.first() else {
        bail!("priorities needs a category\n{}", USAGE);
    };
    let Some(category) = MetricCategory::parse(name) else {
        bail!("Unknown category: {}", name);
    };

    let matrix = PriorityMatrix::global();
    println!("🥇 {} sources for {}:", matrix.ranked_sources(category).len(), category);
    for (rank, source) in matrix.ranked_sources(category).iter().enumerate() {
        println!("  {}. {:<14} {}", rank + 1, source, matrix.priority(*source, category));
    }

    Ok(())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid date: {}", s))
}
