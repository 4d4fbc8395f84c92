use metric_trust_core::{
    days_ago, now_utc, score_metric, HistoryEntry, Metric, Result, ScoreSnapshot, ScoringPolicy,
    TrustAssessment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::SqliteMetricStore;

const MIN_HISTORY_WINDOW: usize = 10;
const DEFAULT_HISTORY_WINDOW: usize = 50;
const DEFAULT_SNAPSHOT_WINDOW_DAYS: u32 = 90;

/// The slice of the record store the score recorder reads and writes.
pub trait MetricRepository {
    fn metric(&self, id: &str) -> Result<Metric>;

    /// Entries changed in `since..=as_of` plus the newest `newest` entries up
    /// to `as_of`, most recent first.
    fn history_for_scoring(
        &self,
        id: &str,
        as_of: OffsetDateTime,
        since: OffsetDateTime,
        newest: usize,
    ) -> Result<Vec<HistoryEntry>>;

    /// Snapshots recorded in the `window_days` ending at `as_of`.
    fn score_window(
        &self,
        id: &str,
        window_days: u32,
        as_of: OffsetDateTime,
    ) -> Result<Vec<ScoreSnapshot>>;

    fn save_snapshot(&mut self, id: &str, score: f64, breakdown: &Value) -> Result<ScoreSnapshot>;
}

impl MetricRepository for SqliteMetricStore {
    fn metric(&self, id: &str) -> Result<Metric> {
        self.get(id)
    }

    fn history_for_scoring(
        &self,
        id: &str,
        as_of: OffsetDateTime,
        since: OffsetDateTime,
        newest: usize,
    ) -> Result<Vec<HistoryEntry>> {
        self.history_as_of(id, as_of, since, newest)
    }

    fn score_window(
        &self,
        id: &str,
        window_days: u32,
        as_of: OffsetDateTime,
    ) -> Result<Vec<ScoreSnapshot>> {
        self.score_history_at(id, window_days, as_of)
    }

    fn save_snapshot(&mut self, id: &str, score: f64, breakdown: &Value) -> Result<ScoreSnapshot> {
        self.record_score_snapshot(id, score, breakdown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedScore {
    pub assessment: TrustAssessment,
    pub snapshot: ScoreSnapshot,
}

/// Runs the scoring engine over repository data and persists the result.
pub struct ScoreRecorder<'a, R: MetricRepository> {
    repository: &'a mut R,
    policy: ScoringPolicy,
    history_window: usize,
    snapshot_window_days: u32,
}

impl<'a, R: MetricRepository> ScoreRecorder<'a, R> {
    /// # Errors
    /// Returns [`metric_trust_core::MetricError::Configuration`] when the
    /// policy is invalid.
    pub fn new(repository: &'a mut R, policy: ScoringPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            repository,
            policy,
            history_window: DEFAULT_HISTORY_WINDOW,
            snapshot_window_days: DEFAULT_SNAPSHOT_WINDOW_DAYS,
        })
    }

    /// Newest history entries fed to the engine on top of the trend windows;
    /// never fewer than ten so the consistency check sees a full window.
    #[must_use]
    pub fn with_history_window(mut self, entries: usize) -> Self {
        self.history_window = entries.max(MIN_HISTORY_WINDOW);
        self
    }

    #[must_use]
    pub fn with_snapshot_window_days(mut self, days: u32) -> Self {
        self.snapshot_window_days = days;
        self
    }

    /// # Errors
    /// Propagates repository errors and engine validation errors.
    pub fn evaluate(&self, id: &str) -> Result<TrustAssessment> {
        self.evaluate_at(id, now_utc())
    }

    /// # Errors
    /// Propagates repository errors and engine validation errors.
    pub fn evaluate_at(&self, id: &str, as_of: OffsetDateTime) -> Result<TrustAssessment> {
        let metric = self.repository.metric(id)?;
        let trend_start = days_ago(as_of, self.policy.trend_window_days.saturating_mul(2));
        let newest = self.history_window.max(self.policy.consistency_window);
        let history = self
            .repository
            .history_for_scoring(id, as_of, trend_start, newest)?;
        let snapshots = self
            .repository
            .score_window(id, self.snapshot_window_days, as_of)?;

        let assessment = score_metric(&metric, &history, &snapshots, as_of, &self.policy)?;
        tracing::debug!(
            metric_id = %id,
            score = assessment.score,
            trend = assessment.trend.as_str(),
            history_entries = history.len(),
            snapshots = snapshots.len(),
            "metric evaluated"
        );
        Ok(assessment)
    }

    /// Scores the metric and appends the result as a snapshot, refreshing its
    /// cached trust score.
    ///
    /// # Errors
    /// Propagates repository errors and engine validation errors.
    pub fn evaluate_and_record(&mut self, id: &str) -> Result<RecordedScore> {
        let assessment = self.evaluate(id)?;
        let snapshot =
            self.repository
                .save_snapshot(id, assessment.score, &assessment.breakdown_json())?;
        Ok(RecordedScore {
            assessment,
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_trust_core::{
        format_storage_timestamp, FieldChange, MetricChanges, MetricError, NewMetric, TestStatus,
        Trend, ValidationTestInput,
    };
    use rusqlite::params;
    use std::path::Path;
    use time::Duration;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteMetricStore {
        let mut store = must(SqliteMetricStore::open(Path::new(":memory:")));
        must(store.migrate());
        must(store.create(NewMetric {
            id: "churn_rate".to_string(),
            name: "Churn rate".to_string(),
            calculation: "lost / active".to_string(),
            ..NewMetric::default()
        }));
        store
    }

    fn seed_history(store: &SqliteMetricStore, changed_at: OffsetDateTime, count: usize) {
        let changed_at = must(format_storage_timestamp(changed_at));
        for _ in 0..count {
            if let Err(err) = store.connection().execute(
                "INSERT INTO metric_history(
                    change_id, metric_id, field_name, old_value, new_value, changed_by, changed_at
                 ) VALUES (?1, 'churn_rate', 'description', '\"\"', '\"seeded\"', 'seed', ?2)",
                params![Ulid::new().to_string(), changed_at],
            ) {
                panic!("failed to seed history row: {err}");
            }
        }
    }

    fn seed_snapshot(store: &SqliteMetricStore, recorded_at: OffsetDateTime) {
        let recorded_at = must(format_storage_timestamp(recorded_at));
        if let Err(err) = store.connection().execute(
            "INSERT INTO trust_score_history(metric_id, score, breakdown, recorded_at)
             VALUES ('churn_rate', 50.0, '{}', ?1)",
            params![recorded_at],
        ) {
            panic!("failed to seed snapshot row: {err}");
        }
    }

    #[test]
    fn recording_refreshes_cached_trust_score() {
        let mut store = fixture_store();
        let recorded = {
            let mut recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
            must(recorder.evaluate_and_record("churn_rate"))
        };

        assert!(recorded.assessment.score <= 50.0);
        assert!((recorded.snapshot.score - recorded.assessment.score).abs() < f64::EPSILON);
        assert_eq!(recorded.snapshot.breakdown["trend"], "stable");

        let metric = must(store.get("churn_rate"));
        assert!((metric.trust_score - recorded.assessment.score).abs() < f64::EPSILON);
        assert_eq!(must(store.score_history("churn_rate", 90)).len(), 1);
    }

    #[test]
    fn tests_and_owner_improve_the_recorded_score() {
        let mut store = fixture_store();
        let before = {
            let recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
            must(recorder.evaluate("churn_rate"))
        };

        for _ in 0..4 {
            must(store.record_test(
                "churn_rate",
                &ValidationTestInput {
                    test_type: "range".to_string(),
                    expression: "SELECT churn FROM kpis".to_string(),
                    expected_result: "between 0 and 1".to_string(),
                    status: TestStatus::Pass,
                    last_run: None,
                },
            ));
        }
        must(store.update(
            "churn_rate",
            &MetricChanges::new().with(FieldChange::Owner(Some("retention".to_string()))),
            Some("alice"),
        ));

        let after = {
            let recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
            must(recorder.evaluate("churn_rate"))
        };
        assert!(after.score > before.score);
    }

    #[test]
    fn trend_stays_stable_until_two_snapshots_exist() {
        let mut store = fixture_store();
        let mut recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
        let first = must(recorder.evaluate_and_record("churn_rate"));
        let second = must(recorder.evaluate_and_record("churn_rate"));
        assert_eq!(first.assessment.trend, Trend::Stable);
        assert_eq!(second.assessment.trend, Trend::Stable);
    }

    #[test]
    fn invalid_policy_and_unknown_metric_are_reported() {
        let mut store = fixture_store();
        let mut policy = ScoringPolicy::v1();
        policy.weights.usage = 0.0;
        assert!(matches!(
            ScoreRecorder::new(&mut store, policy),
            Err(MetricError::Configuration(_))
        ));

        let mut recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
        assert!(matches!(
            recorder.evaluate_and_record("missing"),
            Err(MetricError::NotFound { .. })
        ));
    }

    #[test]
    fn history_window_has_a_floor() {
        let mut store = fixture_store();
        let recorder =
            must(ScoreRecorder::new(&mut store, ScoringPolicy::v1())).with_history_window(2);
        assert_eq!(recorder.history_window, MIN_HISTORY_WINDOW);
    }

    #[test]
    fn trend_sees_both_windows_beyond_the_history_window() {
        let mut store = fixture_store();
        let now = now_utc();
        seed_history(&store, now - Duration::days(5), 60);
        seed_history(&store, now - Duration::days(45), 60);
        seed_snapshot(&store, now - Duration::days(2));
        seed_snapshot(&store, now - Duration::days(1));

        let recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
        let assessment = must(recorder.evaluate_at("churn_rate", now));
        assert_eq!(assessment.trend, Trend::Stable);

        let full_history = must(store.history("churn_rate", 1_000));
        assert_eq!(full_history.len(), 120);
        let snapshots = must(store.score_history_at("churn_rate", 90, now));
        let metric = must(store.get("churn_rate"));
        let direct = must(score_metric(
            &metric,
            &full_history,
            &snapshots,
            now,
            &ScoringPolicy::v1(),
        ));
        assert_eq!(direct.trend, assessment.trend);
    }

    #[test]
    fn past_evaluation_uses_snapshots_around_that_instant() {
        let mut store = fixture_store();
        let now = now_utc();
        let as_of = now - Duration::days(20);
        seed_history(&store, as_of - Duration::days(5), 10);
        seed_snapshot(&store, now - Duration::days(2));
        seed_snapshot(&store, now - Duration::days(1));

        {
            let recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
            let assessment = must(recorder.evaluate_at("churn_rate", as_of));
            assert_eq!(assessment.trend, Trend::Stable);
        }

        // Outside the trailing 90 days of wall-clock time but inside the
        // window that ends at `as_of`.
        seed_snapshot(&store, now - Duration::days(100));
        seed_snapshot(&store, as_of - Duration::days(3));

        let recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
        let assessment = must(recorder.evaluate_at("churn_rate", as_of));
        assert_eq!(assessment.trend, Trend::Improving);
        assert_eq!(must(store.score_history_at("churn_rate", 90, as_of)).len(), 2);
        assert_eq!(must(store.score_history("churn_rate", 90)).len(), 3);
    }

    #[test]
    fn history_after_the_evaluation_instant_is_ignored() {
        let mut store = fixture_store();
        let now = now_utc();
        let as_of = now - Duration::days(20);
        seed_history(&store, now - Duration::days(1), 10);
        seed_snapshot(&store, as_of - Duration::days(4));
        seed_snapshot(&store, as_of - Duration::days(3));

        let recorder = must(ScoreRecorder::new(&mut store, ScoringPolicy::v1()));
        let assessment = must(recorder.evaluate_at("churn_rate", as_of));
        assert_eq!(assessment.trend, Trend::Stable);
        assert!(must(store.history_as_of("churn_rate", as_of, as_of - Duration::days(60), 50))
            .is_empty());
    }
}
