use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::Value;

use crate::models::{
    AnalysisJob, JobStats, JobStatus, JobUpdate, NewAnalysisJob, RecentJob, StatsSummary,
    StatsTimings, StatusCounts,
};

const PROCESSING: &str = "analysis_processing";

const JOB_COLUMNS: &str = "token, owner, status, feature_count, analysis_options, created_at, \
     started_at, completed_at, timeout_ms, error_message";

/// Durable job rows in SQLite. Timestamps are stored as Unix milliseconds.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening job database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory job database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS analysis_jobs (
                token TEXT PRIMARY KEY,
                owner TEXT,
                status TEXT NOT NULL,
                feature_count INTEGER NOT NULL,
                analysis_options TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                timeout_ms INTEGER,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_analysis_jobs_owner_status
                ON analysis_jobs (owner, status);
            CREATE INDEX IF NOT EXISTS idx_analysis_jobs_owner_created
                ON analysis_jobs (owner, created_at);
            ",
        )
        .context("Failed to initialise analysis_jobs schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            op(&guard)
        })
        .await
        .context("Job store task failed")?
    }

    /// Inserts a PROCESSING row; an existing token is left untouched.
    pub async fn create_job(&self, job: NewAnalysisJob) -> Result<()> {
        self.with_conn(move |conn| {
            let options = job
                .analysis_options
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("Failed to encode analysis options")?;
            conn.execute(
                "INSERT INTO analysis_jobs
                    (token, owner, status, feature_count, analysis_options, created_at, timeout_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (token) DO NOTHING",
                params![
                    job.token,
                    job.owner,
                    PROCESSING,
                    job.feature_count as i64,
                    options,
                    job.created_at.timestamp_millis(),
                    job.timeout_ms as i64,
                ],
            )
            .with_context(|| format!("Failed to insert job {}", job.token))?;
            Ok(())
        })
        .await
    }

    /// Applies the supplied fields only. Status changes are accepted only
    /// while the row is still PROCESSING. `completed_at` is written only
    /// together with a terminal status, which always carries one. Returns
    /// whether a row changed.
    pub async fn update_job(&self, token: &str, update: JobUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let token = token.to_string();
        self.with_conn(move |conn| {
            let mut sets: Vec<&str> = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();

            let completed_at = match update.status {
                Some(status) if status.is_terminal() => {
                    Some(update.completed_at.unwrap_or_else(Utc::now))
                }
                _ => None,
            };

            if let Some(status) = update.status {
                sets.push("status = ?");
                values.push(SqlValue::Text(status.as_str().to_string()));
            }
            if let Some(started_at) = update.started_at {
                sets.push("started_at = ?");
                values.push(SqlValue::Integer(started_at.timestamp_millis()));
            }
            if let Some(completed_at) = completed_at {
                sets.push("completed_at = ?");
                values.push(SqlValue::Integer(completed_at.timestamp_millis()));
            }
            if let Some(timeout_ms) = update.timeout_ms {
                sets.push("timeout_ms = ?");
                values.push(SqlValue::Integer(timeout_ms as i64));
            }
            if let Some(error_message) = update.error_message {
                sets.push("error_message = ?");
                values.push(SqlValue::Text(error_message));
            }
            if let Some(feature_count) = update.feature_count {
                sets.push("feature_count = ?");
                values.push(SqlValue::Integer(feature_count as i64));
            }

            if sets.is_empty() {
                return Ok(false);
            }

            let mut sql = format!(
                "UPDATE analysis_jobs SET {} WHERE token = ?",
                sets.join(", ")
            );
            values.push(SqlValue::Text(token.clone()));
            if update.status.is_some() {
                sql.push_str(" AND status = '");
                sql.push_str(PROCESSING);
                sql.push('\'');
            }

            let changed = conn
                .execute(&sql, params_from_iter(values))
                .with_context(|| format!("Failed to update job {token}"))?;
            Ok(changed > 0)
        })
        .await
    }

    /// Moves a PROCESSING row to `status`; a no-op (false) for rows that
    /// are already terminal or missing.
    pub async fn finish_job(
        &self,
        token: &str,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        anyhow::ensure!(status.is_terminal(), "finish_job requires a terminal status");
        self.update_job(
            token,
            JobUpdate {
                status: Some(status),
                completed_at: Some(Utc::now()),
                error_message,
                ..JobUpdate::default()
            },
        )
        .await
    }

    pub async fn get_job(&self, token: &str) -> Result<Option<AnalysisJob>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE token = ?1"),
                params![token],
                row_to_job,
            )
            .optional()
            .with_context(|| format!("Failed to load job {token}"))
        })
        .await
    }

    /// PROCESSING rows for `owner` whose timeout budget has not yet run out
    /// at `now`. Rows past `startedAt + timeoutMs` are presumed abandoned;
    /// this is a heuristic, not a liveness check.
    pub async fn count_running(&self, owner: &str, now: DateTime<Utc>) -> Result<u32> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let running: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM analysis_jobs
                     WHERE owner = ?1
                       AND status = ?2
                       AND (timeout_ms IS NULL
                            OR COALESCE(started_at, created_at) + timeout_ms > ?3)",
                    params![owner, PROCESSING, now.timestamp_millis()],
                    |row| row.get(0),
                )
                .context("Failed to count running jobs")?;
            Ok(running.max(0) as u32)
        })
        .await
    }

    /// Aggregates for `owner`. `resultsAvailable` is left false; callers that
    /// can see the artifact directory fill it in.
    pub async fn stats(&self, owner: &str, now: DateTime<Utc>, recent: usize) -> Result<JobStats> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let day_ago = (now - ChronoDuration::hours(24)).timestamp_millis();
            let week_ago = (now - ChronoDuration::days(7)).timestamp_millis();
            let summary = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN created_at >= ?2 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN created_at >= ?3 THEN 1 ELSE 0 END), 0)
                     FROM analysis_jobs WHERE owner = ?1",
                    params![owner, day_ago, week_ago],
                    |row| {
                        Ok(StatsSummary {
                            total: row.get::<_, i64>(0)? as u64,
                            last24h: row.get::<_, i64>(1)? as u64,
                            last7d: row.get::<_, i64>(2)? as u64,
                        })
                    },
                )
                .context("Failed to compute job summary")?;

            let mut status_counts = StatusCounts::default();
            {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM analysis_jobs WHERE owner = ?1 GROUP BY status",
                )?;
                let rows = stmt.query_map(params![owner], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (status, count) = row?;
                    let count = count as u64;
                    match JobStatus::parse(&status) {
                        Some(JobStatus::Processing) => status_counts.processing = count,
                        Some(JobStatus::Completed) => status_counts.completed = count,
                        Some(JobStatus::Error) => status_counts.error = count,
                        Some(JobStatus::Timeout) => status_counts.timeout = count,
                        None => {}
                    }
                }
            }

            let mut run_durations: Vec<i64> = {
                let mut stmt = conn.prepare(
                    "SELECT completed_at - started_at FROM analysis_jobs
                     WHERE owner = ?1 AND started_at IS NOT NULL AND completed_at IS NOT NULL",
                )?;
                let rows = stmt.query_map(params![owner], |row| row.get::<_, i64>(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            run_durations.sort_unstable();

            let avg_queue_ms: Option<f64> = conn
                .query_row(
                    "SELECT AVG(started_at - created_at) FROM analysis_jobs
                     WHERE owner = ?1 AND started_at IS NOT NULL",
                    params![owner],
                    |row| row.get(0),
                )
                .context("Failed to compute queue timings")?;

            let timings = StatsTimings {
                avg_run_ms: average(&run_durations),
                p50_run_ms: median(&run_durations),
                avg_queue_ms,
            };

            let recent_jobs = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE owner = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![owner, recent as i64], row_to_job)?;
                rows.map(|row| row.map(RecentJob::from))
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            Ok(JobStats {
                summary,
                status_counts,
                timings,
                recent_jobs,
            })
        })
        .await
    }
}

impl From<AnalysisJob> for RecentJob {
    fn from(job: AnalysisJob) -> Self {
        Self {
            token: job.token,
            status: job.status,
            feature_count: Some(job.feature_count),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message,
            results_available: false,
        }
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisJob> {
    let status_raw: String = row.get(2)?;
    let status = JobStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job status `{status_raw}`").into(),
        )
    })?;
    let options: Option<String> = row.get(4)?;
    let analysis_options = options.and_then(|raw| serde_json::from_str::<Value>(&raw).ok());

    Ok(AnalysisJob {
        token: row.get(0)?,
        owner: row.get(1)?,
        status,
        feature_count: row.get::<_, i64>(3)?.max(0) as u64,
        analysis_options,
        created_at: millis_to_datetime(row.get(5)?),
        started_at: row.get::<_, Option<i64>>(6)?.map(millis_to_datetime),
        completed_at: row.get::<_, Option<i64>>(7)?.map(millis_to_datetime),
        timeout_ms: row.get::<_, Option<i64>>(8)?.map(|v| v.max(0) as u64),
        error_message: row.get(9)?,
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn average(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64)
}

/// Median of an already sorted slice.
fn median(sorted: &[i64]) -> Option<f64> {
    let len = sorted.len();
    match len {
        0 => None,
        _ if len % 2 == 1 => Some(sorted[len / 2] as f64),
        _ => Some((sorted[len / 2 - 1] + sorted[len / 2]) as f64 / 2.0),
    }
}
