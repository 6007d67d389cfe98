use crate::observation::{DataSource, Observation};
use crate::store::{MetricQuery, MetricStore};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection};
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Row of a normalized observations CSV.
/// Vendor payloads are converted to this shape before they reach us.
#[derive(Debug, Deserialize, Clone)]
pub struct ObservationRecord {
    #[serde(rename = "User_Id")]
    pub user_id: String,

    #[serde(rename = "Metric")]
    pub metric_name: String,

    #[serde(rename = "Source")]
    pub source: String,

    #[serde(rename = "Value")]
    pub value: f64,

    #[serde(rename = "Unit")]
    pub unit: String,

    /// YYYY-MM-DD
    #[serde(rename = "Measurement_Date")]
    pub measurement_date: NaiveDate,

    /// RFC 3339
    #[serde(rename = "Recorded_At")]
    pub recorded_at: DateTime<Utc>,
}

impl ObservationRecord {
    pub fn into_observation(self) -> Result<Observation> {
        let source = DataSource::parse(&self.source)?;

        Ok(Observation::new(
            &self.user_id,
            &self.metric_name,
            source,
            self.value,
            &self.unit,
            self.measurement_date,
            self.recorded_at,
        ))
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases silently keep "memory"
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS observations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            obs_uuid TEXT UNIQUE NOT NULL,
            user_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            source TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            measurement_date TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_obs_user_metric_date
         ON observations(user_id, metric_name, measurement_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_obs_source ON observations(source)",
        [],
    )?;

    Ok(())
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<Observation>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut observations = Vec::new();

    for (line, result) in rdr.deserialize().enumerate() {
        let record: ObservationRecord =
            result.with_context(|| format!("Failed to deserialize observation on row {}", line + 1))?;

        let observation = record
            .into_observation()
            .with_context(|| format!("Invalid observation on row {}", line + 1))?;

        observations.push(observation);
    }

    Ok(observations)
}

/// Insert observations, skipping ones already stored (same idempotency hash).
/// Returns how many rows were new.
pub fn insert_observations(conn: &Connection, observations: &[Observation]) -> Result<usize> {
    let mut inserted = 0;
    let mut duplicates = 0;

    for obs in observations {
        let result = conn.execute(
            "INSERT INTO observations (
                idempotency_hash, obs_uuid, user_id, metric_name, source,
                value, unit, measurement_date, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                obs.idempotency_hash(),
                obs.id,
                obs.user_id,
                obs.metric_name,
                obs.source.as_str(),
                obs.value,
                obs.unit,
                obs.measurement_date.to_string(),
                obs.recorded_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(inserted, duplicates, "Stored observations");

    Ok(inserted)
}

pub fn get_observations(
    conn: &Connection,
    user_id: &str,
    query: &MetricQuery,
) -> Result<Vec<Observation>> {
    let mut sql = String::from(
        "SELECT obs_uuid, user_id, metric_name, source, value, unit,
                measurement_date, recorded_at
         FROM observations
         WHERE user_id = ?",
    );
    let mut args: Vec<String> = vec![user_id.to_string()];

    if let Some(names) = &query.metric_names {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        sql.push_str(&format!(" AND metric_name IN ({})", placeholders));
        args.extend(names.iter().cloned());
    }

    if let Some(range) = &query.date_range {
        sql.push_str(" AND measurement_date >= ? AND measurement_date <= ?");
        args.push(range.start.to_string());
        args.push(range.end.to_string());
    }

    // Stable order keeps downstream output deterministic
    sql.push_str(" ORDER BY measurement_date DESC, metric_name, id");

    let mut stmt = conn.prepare(&sql)?;

    let observations = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            let source_str: String = row.get(3)?;
            let date_str: String = row.get(6)?;
            let recorded_str: String = row.get(7)?;

            let source = DataSource::parse(&source_str)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
            let measurement_date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_str)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?
                .with_timezone(&Utc);

            Ok(Observation {
                id: row.get(0)?,
                user_id: row.get(1)?,
                metric_name: row.get(2)?,
                source,
                value: row.get(4)?,
                unit: row.get(5)?,
                measurement_date,
                recorded_at,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    debug!(user_id, rows = observations.len(), "Fetched observations");

    Ok(observations)
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// `MetricStore` backed by a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    /// `busy_timeout` bounds how long a fetch waits on a locked database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;
        conn.busy_timeout(busy_timeout)?;
        setup_database(&conn)?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, observations: &[Observation]) -> Result<usize> {
        let conn = self.lock();
        insert_observations(&conn, observations)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.lock();
        verify_count(&conn)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricStore for SqliteStore {
    fn fetch_observations(&self, user_id: &str, query: &MetricQuery) -> Result<Vec<Observation>> {
        let conn = self.lock();
        get_observations(&conn, user_id, query)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::DateRange;
    use chrono::TimeZone;
    use std::io::Write;

    fn obs(metric: &str, source: DataSource, value: f64, day: u32) -> Observation {
        Observation::new(
            "user-1",
            metric,
            source,
            value,
            "kg",
            NaiveDate::from_ymd_opt(2025, 2, day).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, day, 7, 15, 0).unwrap(),
        )
    }

    #[test]
    fn test_insert_and_fetch_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let original = obs("weight", DataSource::Withings, 72.4, 3);

        assert_eq!(store.insert(&[original.clone()]).unwrap(), 1);

        let fetched = store.fetch_observations("user-1", &MetricQuery::all()).unwrap();
        assert_eq!(fetched, vec![original]);
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = obs("weight", DataSource::Withings, 72.4, 3);
        let mut reimport = a.clone();
        reimport.id = uuid::Uuid::new_v4().to_string();

        assert_eq!(store.insert(&[a]).unwrap(), 1);
        assert_eq!(store.insert(&[reimport]).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_fetch_filters_metrics_and_range() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert(&[
                obs("weight", DataSource::Withings, 72.4, 1),
                obs("weight", DataSource::BodyScanner, 72.0, 10),
                obs("hrv", DataSource::Whoop, 55.0, 10),
                obs("steps", DataSource::Garmin, 9000.0, 10),
            ])
            .unwrap();

        let query = MetricQuery::metrics(&["weight".to_string(), "hrv".to_string()]);
        let fetched = store.fetch_observations("user-1", &query).unwrap();
        assert_eq!(fetched.len(), 3);
        // Newest first
        assert_eq!(fetched[0].measurement_date, NaiveDate::from_ymd_opt(2025, 2, 10).unwrap());

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 2, 5).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap(),
        )
        .unwrap();
        let ranged = store
            .fetch_observations("user-1", &MetricQuery::metrics(&["weight".to_string()]).with_range(range))
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].source, DataSource::BodyScanner);

        assert!(store.fetch_observations("someone-else", &MetricQuery::all()).unwrap().is_empty());
        assert!(store
            .fetch_observations("user-1", &MetricQuery::metrics(&[]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_load_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "User_Id,Metric,Source,Value,Unit,Measurement_Date,Recorded_At").unwrap();
        writeln!(file, "user-1,weight,Withings,72.4,kg,2025-02-03,2025-02-03T07:15:00Z").unwrap();
        writeln!(file, "user-1,sleep_duration,oura ring,7.5,h,2025-02-03,2025-02-03T06:00:00+00:00").unwrap();
        file.flush().unwrap();

        let observations = load_csv(file.path()).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].source, DataSource::Withings);
        assert_eq!(observations[1].source, DataSource::Oura);
        assert_eq!(observations[1].value, 7.5);
    }

    #[test]
    fn test_load_csv_rejects_unknown_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "User_Id,Metric,Source,Value,Unit,Measurement_Date,Recorded_At").unwrap();
        writeln!(file, "user-1,weight,fitbit,72.4,kg,2025-02-03,2025-02-03T07:15:00Z").unwrap();
        file.flush().unwrap();

        assert!(load_csv(file.path()).is_err());
    }
}
