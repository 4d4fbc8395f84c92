#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use metric_trust_core::{
    days_ago, format_storage_timestamp, now_utc, parse_rfc3339_utc, DeleteReport, FieldDiff,
    HistoryEntry, Metric, MetricChanges, MetricError, MetricField, NewMetric, Result,
    ScoreSnapshot, TestStatus, UsageEvent, UsageStats, ValidationTest, ValidationTestInput,
};
use rusqlite::types::Type;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

mod config;
mod recorder;

pub use config::StoreConfig;
pub use recorder::{MetricRepository, RecordedScore, ScoreRecorder};

const SCHEMA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_METRICS_V1: &str = r"
CREATE TABLE IF NOT EXISTS metrics (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  calculation TEXT NOT NULL,
  owner TEXT,
  data_source TEXT,
  tags TEXT NOT NULL DEFAULT '[]',
  dependencies TEXT NOT NULL DEFAULT '[]',
  test_count INTEGER NOT NULL DEFAULT 0 CHECK (test_count >= 0),
  usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL CHECK (updated_at >= created_at),
  trust_score REAL NOT NULL DEFAULT 0.0 CHECK (trust_score BETWEEN 0.0 AND 100.0)
);

CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics(name);
CREATE INDEX IF NOT EXISTS idx_metrics_owner ON metrics(owner);

CREATE TABLE IF NOT EXISTS metric_history (
  history_id INTEGER PRIMARY KEY AUTOINCREMENT,
  change_id TEXT NOT NULL,
  metric_id TEXT NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
  field_name TEXT NOT NULL CHECK (
    field_name IN (
      'name',
      'description',
      'calculation',
      'owner',
      'data_source',
      'tags',
      'dependencies'
    )
  ),
  old_value TEXT NOT NULL,
  new_value TEXT NOT NULL,
  changed_by TEXT,
  changed_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_metric_history_no_update
BEFORE UPDATE ON metric_history
BEGIN
  SELECT RAISE(FAIL, 'metric_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_metric_history_metric_changed
  ON metric_history(metric_id, changed_at DESC);
CREATE INDEX IF NOT EXISTS idx_metric_history_change
  ON metric_history(change_id);

CREATE TABLE IF NOT EXISTS validation_tests (
  test_id INTEGER PRIMARY KEY AUTOINCREMENT,
  metric_id TEXT NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
  test_type TEXT NOT NULL,
  test_expression TEXT NOT NULL,
  expected_result TEXT NOT NULL,
  last_run TEXT,
  status TEXT NOT NULL CHECK (status IN ('pass', 'fail', 'unknown'))
);

CREATE INDEX IF NOT EXISTS idx_validation_tests_metric_status
  ON validation_tests(metric_id, status);

CREATE TABLE IF NOT EXISTS metric_usage (
  usage_id INTEGER PRIMARY KEY AUTOINCREMENT,
  metric_id TEXT NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
  used_by TEXT NOT NULL,
  used_at TEXT NOT NULL,
  context TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_metric_usage_no_update
BEFORE UPDATE ON metric_usage
BEGIN
  SELECT RAISE(FAIL, 'metric_usage is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_metric_usage_metric_used
  ON metric_usage(metric_id, used_at DESC);

CREATE TABLE IF NOT EXISTS trust_score_history (
  snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
  metric_id TEXT NOT NULL REFERENCES metrics(id) ON DELETE CASCADE,
  score REAL NOT NULL CHECK (score BETWEEN 0.0 AND 100.0),
  breakdown TEXT NOT NULL DEFAULT '{}',
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_trust_score_history_no_update
BEFORE UPDATE ON trust_score_history
BEGIN
  SELECT RAISE(FAIL, 'trust_score_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_trust_score_history_metric_recorded
  ON trust_score_history(metric_id, recorded_at DESC);
";

const METRIC_COLUMNS: &str = "id, name, description, calculation, owner, data_source, tags, \
     dependencies, test_count, usage_count, created_at, updated_at, trust_score";

const HISTORY_COLUMNS: &str =
    "history_id, change_id, metric_id, field_name, old_value, new_value, changed_by, changed_at";

const TEST_COLUMNS: &str =
    "test_id, metric_id, test_type, test_expression, expected_result, last_run, status";

const USAGE_COLUMNS: &str = "usage_id, metric_id, used_by, used_at, context";

const SNAPSHOT_COLUMNS: &str = "snapshot_id, metric_id, score, breakdown, recorded_at";

pub struct SqliteMetricStore {
    conn: Connection,
    config: StoreConfig,
}

/// Result of one `update` call. `change_id` is `None` when nothing changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateReport {
    pub metric: Metric,
    pub change_id: Option<Ulid>,
    pub history: Vec<HistoryEntry>,
}

/// Failure inside a store closure: either a raw SQLite error, still eligible
/// for busy retry, or an already-typed domain error.
#[derive(Debug)]
enum StoreFault {
    Sql(rusqlite::Error),
    Domain(MetricError),
}

impl From<rusqlite::Error> for StoreFault {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<MetricError> for StoreFault {
    fn from(err: MetricError) -> Self {
        Self::Domain(err)
    }
}

impl StoreFault {
    fn is_busy(&self) -> bool {
        matches!(self, Self::Sql(err) if is_busy(err))
    }

    fn into_metric_error(self, operation: &str) -> MetricError {
        match self {
            Self::Domain(err) => err,
            Self::Sql(err) => classify_sql_error(operation, &err),
        }
    }
}

type Step<T> = std::result::Result<T, StoreFault>;

impl SqliteMetricStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: &Path, config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let conn = Connection::open(path).map_err(|err| {
            MetricError::StorageUnavailable(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.busy_timeout(config.busy_timeout())
            .map_err(|err| classify_sql_error("configure busy timeout", &err))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|err| classify_sql_error("configure pragmas", &err))?;

        tracing::debug!(
            path = %path.display(),
            busy_timeout_ms = config.busy_timeout_ms,
            "opened metric store"
        );
        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn migrate(&mut self) -> Result<()> {
        self.write("migrate", |tx| {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )?;
            tx.execute_batch(SCHEMA_METRICS_V1)?;
            let applied = tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, format_storage_timestamp(now_utc())?],
            )?;
            if applied > 0 {
                tracing::info!(
                    version = SCHEMA_MIGRATION_VERSION,
                    "applied metric schema migration"
                );
            }
            Ok(())
        })
    }

    pub fn create(&mut self, input: NewMetric) -> Result<Metric> {
        input.validate()?;
        let metric = input.into_metric(now_utc());

        self.write("create metric", |tx| {
            insert_metric(tx, &metric)?;
            Ok(())
        })?;

        tracing::info!(metric_id = %metric.id, owner = ?metric.owner, "metric created");
        Ok(metric)
    }

    pub fn get(&self, id: &str) -> Result<Metric> {
        let metric = self
            .read("get metric", |conn| fetch_metric(conn, id))?
            .ok_or_else(|| MetricError::not_found(id))?;
        tracing::debug!(metric_id = %id, "metric loaded");
        Ok(metric)
    }

    /// Lazily walks every record in identifier order, one page at a time.
    /// Each call starts a fresh walk.
    #[must_use]
    pub fn list_all(&self) -> MetricPages<'_> {
        MetricPages {
            store: self,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn update(
        &mut self,
        id: &str,
        changes: &MetricChanges,
        actor: Option<&str>,
    ) -> Result<UpdateReport> {
        changes.validate(id)?;

        let report = self.write("update metric", |tx| {
            let mut metric = fetch_metric(tx, id)?.ok_or_else(|| MetricError::not_found(id))?;
            let diffs = metric.diff(changes);
            if diffs.is_empty() {
                return Ok(UpdateReport {
                    metric,
                    change_id: None,
                    history: Vec::new(),
                });
            }

            let changed_at = now_utc().max(metric.updated_at);
            let change_id = Ulid::new();
            for change in changes {
                metric.apply(change);
            }
            metric.updated_at = changed_at;

            tx.execute(
                "UPDATE metrics SET
                    name = ?2, description = ?3, calculation = ?4, owner = ?5,
                    data_source = ?6, tags = ?7, dependencies = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    metric.id,
                    metric.name,
                    metric.description,
                    metric.calculation,
                    metric.owner,
                    metric.data_source,
                    encode_json(&metric.tags)?,
                    encode_json(&metric.dependencies)?,
                    format_storage_timestamp(changed_at)?,
                ],
            )?;

            let history = diffs
                .into_iter()
                .map(|diff| insert_history(tx, &metric.id, change_id, diff, actor, changed_at))
                .collect::<Step<Vec<_>>>()?;

            Ok(UpdateReport {
                metric,
                change_id: Some(change_id),
                history,
            })
        })?;

        if let Some(change_id) = report.change_id {
            let changed_fields: Vec<&str> =
                report.history.iter().map(|entry| entry.field.as_str()).collect();
            tracing::info!(
                metric_id = %id,
                %change_id,
                actor = actor.unwrap_or("unknown"),
                ?changed_fields,
                "metric updated"
            );
        } else {
            tracing::debug!(metric_id = %id, "update produced no changes");
        }
        Ok(report)
    }

    pub fn delete(&mut self, id: &str) -> Result<DeleteReport> {
        let report = self.write("delete metric", |tx| {
            require_metric(tx, id)?;
            let report = DeleteReport {
                history_entries: count_rows(tx, "metric_history", id)?,
                validation_tests: count_rows(tx, "validation_tests", id)?,
                usage_events: count_rows(tx, "metric_usage", id)?,
                score_snapshots: count_rows(tx, "trust_score_history", id)?,
            };
            tx.execute("DELETE FROM metrics WHERE id = ?1", params![id])?;
            Ok(report)
        })?;

        tracing::info!(metric_id = %id, ?report, "metric deleted");
        Ok(report)
    }

    /// Case-insensitive substring match over name, description and calculation.
    pub fn search(&self, query: &str) -> Result<Vec<Metric>> {
        let needle = query.trim().to_lowercase();
        self.list_all()
            .filter(|item| match item {
                Ok(metric) => matches_query(metric, &needle),
                Err(_) => true,
            })
            .collect()
    }

    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<Metric>> {
        self.read("list metrics by owner", |conn| {
            query_metrics(
                conn,
                &format!("SELECT {METRIC_COLUMNS} FROM metrics WHERE owner = ?1 ORDER BY id ASC"),
                owner,
            )
        })
    }

    pub fn list_by_tag(&self, tag: &str) -> Result<Vec<Metric>> {
        self.read("list metrics by tag", |conn| {
            query_metrics(
                conn,
                &format!(
                    "SELECT {METRIC_COLUMNS} FROM metrics
                     WHERE EXISTS (SELECT 1 FROM json_each(metrics.tags) WHERE json_each.value = ?1)
                     ORDER BY id ASC"
                ),
                tag,
            )
        })
    }

    pub fn record_test(&mut self, id: &str, input: &ValidationTestInput) -> Result<ValidationTest> {
        input.validate()?;
        let last_run = match (input.last_run, input.status) {
            (Some(ran_at), _) => Some(ran_at),
            (None, TestStatus::Unknown) => None,
            (None, _) => Some(now_utc()),
        };

        let test = self.write("record validation test", |tx| {
            require_metric(tx, id)?;
            tx.execute(
                "INSERT INTO validation_tests(
                    metric_id, test_type, test_expression, expected_result, last_run, status
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    input.test_type,
                    input.expression,
                    input.expected_result,
                    last_run.map(format_storage_timestamp).transpose()?,
                    input.status.as_str(),
                ],
            )?;
            let test_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE metrics SET test_count = (
                    SELECT COUNT(*) FROM validation_tests WHERE metric_id = ?1 AND status = 'pass'
                 ) WHERE id = ?1",
                params![id],
            )?;

            Ok(ValidationTest {
                test_id,
                metric_id: id.to_string(),
                test_type: input.test_type.clone(),
                expression: input.expression.clone(),
                expected_result: input.expected_result.clone(),
                last_run,
                status: input.status,
            })
        })?;

        tracing::info!(
            metric_id = %id,
            test_id = test.test_id,
            status = test.status.as_str(),
            "validation test recorded"
        );
        Ok(test)
    }

    pub fn validation_tests(&self, id: &str) -> Result<Vec<ValidationTest>> {
        self.read("list validation tests", |conn| {
            require_metric(conn, id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TEST_COLUMNS} FROM validation_tests
                 WHERE metric_id = ?1
                 ORDER BY test_id ASC"
            ))?;
            let rows = stmt.query_map(params![id], parse_test_row)?;
            collect_rows(rows)
        })
    }

    pub fn record_usage(
        &mut self,
        id: &str,
        actor: &str,
        context: Option<&str>,
    ) -> Result<UsageEvent> {
        if actor.trim().is_empty() {
            return Err(MetricError::InvalidRecord(
                "usage actor MUST be provided".to_string(),
            ));
        }
        let used_at = now_utc();

        let event = self.write("record usage", |tx| {
            require_metric(tx, id)?;
            tx.execute(
                "INSERT INTO metric_usage(metric_id, used_by, used_at, context)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, actor, format_storage_timestamp(used_at)?, context],
            )?;
            let usage_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE metrics SET usage_count = (
                    SELECT COUNT(*) FROM metric_usage WHERE metric_id = ?1
                 ) WHERE id = ?1",
                params![id],
            )?;

            Ok(UsageEvent {
                usage_id,
                metric_id: id.to_string(),
                actor: actor.to_string(),
                used_at,
                context: context.map(ToString::to_string),
            })
        })?;

        tracing::info!(metric_id = %id, actor, "usage recorded");
        Ok(event)
    }

    pub fn usage_stats(&self, id: &str, window_days: u32) -> Result<UsageStats> {
        let since = format_storage_timestamp(days_ago(now_utc(), window_days))?;
        let events = self.read("usage stats", |conn| {
            require_metric(conn, id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {USAGE_COLUMNS} FROM metric_usage
                 WHERE metric_id = ?1 AND used_at >= ?2
                 ORDER BY used_at DESC, usage_id DESC"
            ))?;
            let rows = stmt.query_map(params![id, since], parse_usage_row)?;
            collect_rows(rows)
        })?;

        let unique_users = events.iter().map(|e| e.actor.as_str()).collect::<BTreeSet<_>>();
        let unique_contexts = events
            .iter()
            .filter_map(|e| e.context.as_deref())
            .collect::<BTreeSet<_>>();

        Ok(UsageStats {
            metric_id: id.to_string(),
            window_days,
            total_uses: events.len() as u64,
            unique_users: unique_users.len() as u64,
            unique_contexts: unique_contexts.len() as u64,
            events,
        })
    }

    /// Most recent history entries first.
    pub fn history(&self, id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read("list history", |conn| {
            require_metric(conn, id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM metric_history
                 WHERE metric_id = ?1
                 ORDER BY changed_at DESC, history_id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![id, limit], parse_history_row)?;
            collect_rows(rows)
        })
    }

    /// History a scoring pass at `as_of` reads: every entry changed since
    /// `since` plus the newest `newest` entries, none after `as_of`. Most
    /// recent first.
    pub fn history_as_of(
        &self,
        id: &str,
        as_of: OffsetDateTime,
        since: OffsetDateTime,
        newest: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let until = format_storage_timestamp(as_of)?;
        let since = format_storage_timestamp(since)?;
        let newest = i64::try_from(newest).unwrap_or(i64::MAX);
        self.read("history as of", |conn| {
            require_metric(conn, id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM metric_history
                 WHERE metric_id = ?1
                   AND changed_at <= ?2
                   AND (
                     changed_at >= ?3
                     OR history_id IN (
                       SELECT history_id FROM metric_history
                       WHERE metric_id = ?1 AND changed_at <= ?2
                       ORDER BY changed_at DESC, history_id DESC
                       LIMIT ?4
                     )
                   )
                 ORDER BY changed_at DESC, history_id DESC"
            ))?;
            let rows = stmt.query_map(params![id, until, since, newest], parse_history_row)?;
            collect_rows(rows)
        })
    }

    pub fn record_score_snapshot(
        &mut self,
        id: &str,
        score: f64,
        breakdown: &Value,
    ) -> Result<ScoreSnapshot> {
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(MetricError::InvalidRecord(format!(
                "score MUST be in [0, 100], got {score}"
            )));
        }
        let recorded_at = now_utc();

        let snapshot = self.write("record score snapshot", |tx| {
            require_metric(tx, id)?;
            tx.execute(
                "INSERT INTO trust_score_history(metric_id, score, breakdown, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, score, encode_json(breakdown)?, format_storage_timestamp(recorded_at)?],
            )?;
            let snapshot_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE metrics SET trust_score = ?2 WHERE id = ?1",
                params![id, score],
            )?;

            Ok(ScoreSnapshot {
                snapshot_id,
                metric_id: id.to_string(),
                score,
                breakdown: breakdown.clone(),
                recorded_at,
            })
        })?;

        tracing::info!(metric_id = %id, score, "score snapshot recorded");
        Ok(snapshot)
    }

    /// Snapshots inside the trailing window, newest first.
    pub fn score_history(&self, id: &str, window_days: u32) -> Result<Vec<ScoreSnapshot>> {
        self.score_history_at(id, window_days, now_utc())
    }

    /// Snapshots recorded in the `window_days` ending at `as_of`, newest first.
    pub fn score_history_at(
        &self,
        id: &str,
        window_days: u32,
        as_of: OffsetDateTime,
    ) -> Result<Vec<ScoreSnapshot>> {
        let since = format_storage_timestamp(days_ago(as_of, window_days))?;
        let until = format_storage_timestamp(as_of)?;
        self.read("score history", |conn| {
            require_metric(conn, id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM trust_score_history
                 WHERE metric_id = ?1 AND recorded_at >= ?2 AND recorded_at <= ?3
                 ORDER BY recorded_at DESC, snapshot_id DESC"
            ))?;
            let rows = stmt.query_map(params![id, since, until], parse_snapshot_row)?;
            collect_rows(rows)
        })
    }

    fn fetch_page(&self, after: Option<&str>) -> Result<Vec<Metric>> {
        let page_size = i64::from(self.config.page_size);
        self.read("list metrics", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {METRIC_COLUMNS} FROM metrics
                 WHERE ?1 IS NULL OR id > ?1
                 ORDER BY id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![after, page_size], parse_metric_row)?;
            collect_rows(rows)
        })
    }

    /// Runs `body` in an IMMEDIATE transaction, retrying busy/locked failures
    /// with linear backoff. Dropping an uncommitted transaction rolls it back.
    fn write<T>(
        &mut self,
        operation: &'static str,
        mut body: impl FnMut(&Transaction<'_>) -> Step<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match run_in_transaction(&mut self.conn, &mut body) {
                Ok(value) => return Ok(value),
                Err(fault) if fault.is_busy() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(operation, attempt, "sqlite busy; retrying write");
                    std::thread::sleep(self.config.backoff(attempt));
                }
                Err(fault) => return Err(fault.into_metric_error(operation)),
            }
        }
    }

    fn read<T>(
        &self,
        operation: &'static str,
        mut body: impl FnMut(&Connection) -> Step<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match body(&self.conn) {
                Ok(value) => return Ok(value),
                Err(fault) if fault.is_busy() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(operation, attempt, "sqlite busy; retrying read");
                    std::thread::sleep(self.config.backoff(attempt));
                }
                Err(fault) => return Err(fault.into_metric_error(operation)),
            }
        }
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Keyset-paginated walk over all metrics. Yields an error at most once, then
/// stops.
pub struct MetricPages<'a> {
    store: &'a SqliteMetricStore,
    after: Option<String>,
    buffer: VecDeque<Metric>,
    exhausted: bool,
}

impl Iterator for MetricPages<'_> {
    type Item = Result<Metric>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.fetch_page(self.after.as_deref()) {
                Ok(page) => {
                    let page_size =
                        usize::try_from(self.store.config.page_size).unwrap_or(usize::MAX);
                    if page.len() < page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.after = Some(last.id.clone());
                    }
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn run_in_transaction<T>(
    conn: &mut Connection,
    body: &mut impl FnMut(&Transaction<'_>) -> Step<T>,
) -> Step<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = body(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn insert_metric(tx: &Transaction<'_>, metric: &Metric) -> Step<()> {
    tx.execute(
        &format!(
            "INSERT INTO metrics({METRIC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            metric.id,
            metric.name,
            metric.description,
            metric.calculation,
            metric.owner,
            metric.data_source,
            encode_json(&metric.tags)?,
            encode_json(&metric.dependencies)?,
            i64::from(metric.test_count),
            i64::from(metric.usage_count),
            format_storage_timestamp(metric.created_at)?,
            format_storage_timestamp(metric.updated_at)?,
            metric.trust_score,
        ],
    )
    .map_err(|err| {
        if is_primary_key_violation(&err) {
            StoreFault::Domain(MetricError::DuplicateKey {
                id: metric.id.clone(),
            })
        } else {
            StoreFault::Sql(err)
        }
    })?;
    Ok(())
}

fn insert_history(
    tx: &Transaction<'_>,
    metric_id: &str,
    change_id: Ulid,
    diff: FieldDiff,
    actor: Option<&str>,
    changed_at: OffsetDateTime,
) -> Step<HistoryEntry> {
    tx.execute(
        "INSERT INTO metric_history(
            change_id, metric_id, field_name, old_value, new_value, changed_by, changed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            change_id.to_string(),
            metric_id,
            diff.field.as_str(),
            encode_json(&diff.old_value)?,
            encode_json(&diff.new_value)?,
            actor,
            format_storage_timestamp(changed_at)?,
        ],
    )?;

    Ok(HistoryEntry {
        history_id: tx.last_insert_rowid(),
        change_id,
        metric_id: metric_id.to_string(),
        field: diff.field,
        old_value: diff.old_value,
        new_value: diff.new_value,
        actor: actor.map(ToString::to_string),
        changed_at,
    })
}

fn fetch_metric(conn: &Connection, id: &str) -> Step<Option<Metric>> {
    let metric = conn
        .query_row(
            &format!("SELECT {METRIC_COLUMNS} FROM metrics WHERE id = ?1"),
            params![id],
            parse_metric_row,
        )
        .optional()?;
    Ok(metric)
}

fn require_metric(conn: &Connection, id: &str) -> Step<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM metrics WHERE id = ?1 LIMIT 1",
            params![id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(MetricError::not_found(id).into())
    }
}

fn query_metrics(conn: &Connection, sql: &str, value: &str) -> Step<Vec<Metric>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![value], parse_metric_row)?;
    collect_rows(rows)
}

fn count_rows(conn: &Connection, table_name: &str, metric_id: &str) -> Step<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table_name} WHERE metric_id = ?1"),
        params![metric_id],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn matches_query(metric: &Metric, needle: &str) -> bool {
    [&metric.name, &metric.description, &metric.calculation]
        .iter()
        .any(|haystack| haystack.to_lowercase().contains(needle))
}

fn parse_metric_row(row: &Row<'_>) -> rusqlite::Result<Metric> {
    let tags_raw: String = row.get(6)?;
    let dependencies_raw: String = row.get(7)?;

    Ok(Metric {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        calculation: row.get(3)?,
        owner: row.get(4)?,
        data_source: row.get(5)?,
        tags: parse_json_column(6, &tags_raw)?,
        dependencies: parse_json_column(7, &dependencies_raw)?,
        test_count: parse_count(row, 8)?,
        usage_count: parse_count(row, 9)?,
        created_at: parse_timestamp(row, 10)?,
        updated_at: parse_timestamp(row, 11)?,
        trust_score: row.get(12)?,
    })
}

fn parse_history_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let change_id_raw: String = row.get(1)?;
    let field_raw: String = row.get(3)?;
    let old_raw: String = row.get(4)?;
    let new_raw: String = row.get(5)?;

    let change_id = Ulid::from_string(&change_id_raw).map_err(|err| {
        conversion_failure(1, Type::Text, format!("invalid change_id {change_id_raw}: {err}"))
    })?;
    let field = MetricField::parse(&field_raw).ok_or_else(|| {
        conversion_failure(3, Type::Text, format!("invalid field_name: {field_raw}"))
    })?;

    Ok(HistoryEntry {
        history_id: row.get(0)?,
        change_id,
        metric_id: row.get(2)?,
        field,
        old_value: parse_json_column(4, &old_raw)?,
        new_value: parse_json_column(5, &new_raw)?,
        actor: row.get(6)?,
        changed_at: parse_timestamp(row, 7)?,
    })
}

fn parse_test_row(row: &Row<'_>) -> rusqlite::Result<ValidationTest> {
    let status_raw: String = row.get(6)?;
    let status = TestStatus::parse(&status_raw).ok_or_else(|| {
        conversion_failure(6, Type::Text, format!("invalid test status: {status_raw}"))
    })?;

    Ok(ValidationTest {
        test_id: row.get(0)?,
        metric_id: row.get(1)?,
        test_type: row.get(2)?,
        expression: row.get(3)?,
        expected_result: row.get(4)?,
        last_run: parse_optional_timestamp(row, 5)?,
        status,
    })
}

fn parse_usage_row(row: &Row<'_>) -> rusqlite::Result<UsageEvent> {
    Ok(UsageEvent {
        usage_id: row.get(0)?,
        metric_id: row.get(1)?,
        actor: row.get(2)?,
        used_at: parse_timestamp(row, 3)?,
        context: row.get(4)?,
    })
}

fn parse_snapshot_row(row: &Row<'_>) -> rusqlite::Result<ScoreSnapshot> {
    let breakdown_raw: String = row.get(3)?;
    Ok(ScoreSnapshot {
        snapshot_id: row.get(0)?,
        metric_id: row.get(1)?,
        score: row.get(2)?,
        breakdown: parse_json_column(3, &breakdown_raw)?,
        recorded_at: parse_timestamp(row, 4)?,
    })
}

fn parse_json_column<T: DeserializeOwned>(column: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| {
        conversion_failure(column, Type::Text, format!("invalid stored JSON: {err}"))
    })
}

fn parse_count(row: &Row<'_>, column: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(column)?;
    u32::try_from(raw)
        .map_err(|_| conversion_failure(column, Type::Integer, format!("invalid counter: {raw}")))
}

fn parse_timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(column)?;
    parse_rfc3339_utc(&raw).map_err(|err| conversion_failure(column, Type::Text, err.to_string()))
}

fn parse_optional_timestamp(
    row: &Row<'_>,
    column: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(column)?;
    raw.as_deref()
        .map(|value| {
            parse_rfc3339_utc(value)
                .map_err(|err| conversion_failure(column, Type::Text, err.to_string()))
        })
        .transpose()
}

fn conversion_failure(column: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Step<String> {
    serde_json::to_string(value).map_err(|err| {
        StoreFault::Domain(MetricError::InvalidRecord(format!(
            "failed to encode JSON column: {err}"
        )))
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
) -> Step<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn is_primary_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn classify_sql_error(operation: &str, err: &rusqlite::Error) -> MetricError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            MetricError::InvalidRecord(format!("{operation}: malformed stored row: {err}"))
        }
        _ if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
            MetricError::InvalidRecord(format!("{operation}: constraint violated: {err}"))
        }
        _ => MetricError::StorageUnavailable(format!("{operation}: {err}")),
    }
}

#[cfg(test)]
fn table_exists(conn: &Connection, table_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
        params![table_name],
        |_| Ok(()),
    )
    .optional()
    .ok()
    .flatten()
    .is_some()
}
