use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};

use crate::policy::{ScoreTier, ScoringPolicy};
use crate::{whole_days_between, HistoryEntry, Metric, MetricError, Result, ScoreSnapshot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Freshness,
    Tests,
    Usage,
    Documentation,
    Ownership,
}

impl Factor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Freshness => "freshness",
            Self::Tests => "tests",
            Self::Usage => "usage",
            Self::Documentation => "documentation",
            Self::Ownership => "ownership",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl Trend {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Degrading => "degrading",
        }
    }

    #[must_use]
    pub fn arrow(self) -> &'static str {
        match self {
            Self::Improving => "↗",
            Self::Stable => "→",
            Self::Degrading => "↘",
        }
    }
}

impl Display for Trend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScoreGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ScoreGrade {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Excellent
        } else if score >= 60.0 {
            Self::Good
        } else if score >= 40.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Excellent => "Excellent - production ready",
            Self::Good => "Good - minor improvements recommended",
            Self::Fair => "Fair - several issues to address",
            Self::Poor => "Poor - needs significant work",
        }
    }
}

/// Points earned by each base factor, rounded to one decimal place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub freshness: f64,
    pub tests: f64,
    pub usage: f64,
    pub documentation: f64,
    pub ownership: f64,
}

/// Signed adjustments applied on top of the base factors. `staleness_decay`
/// is never positive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Adjustments {
    pub recent_activity: f64,
    pub consistency: f64,
    pub staleness_decay: f64,
}

impl Adjustments {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.recent_activity + self.consistency + self.staleness_decay
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    pub factor: Factor,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustAssessment {
    pub metric_id: String,
    pub score: f64,
    pub grade: ScoreGrade,
    pub breakdown: ScoreBreakdown,
    pub adjustments: Adjustments,
    pub trend: Trend,
    pub recommendations: Vec<Recommendation>,
    pub days_since_update: i64,
    pub age_days: i64,
    pub policy_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
}

impl TrustAssessment {
    /// Serialized factor breakdown persisted alongside a score snapshot.
    #[must_use]
    pub fn breakdown_json(&self) -> Value {
        json!({
            "policy_version": self.policy_version,
            "factors": {
                "freshness": self.breakdown.freshness,
                "tests": self.breakdown.tests,
                "usage": self.breakdown.usage,
                "documentation": self.breakdown.documentation,
                "ownership": self.breakdown.ownership,
            },
            "adjustments": {
                "recent_activity": self.adjustments.recent_activity,
                "consistency": self.adjustments.consistency,
                "staleness_decay": self.adjustments.staleness_decay,
            },
            "trend": self.trend.as_str(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct FactorScore {
    factor: Factor,
    ratio: f64,
    weight: f64,
}

impl FactorScore {
    fn points(self) -> f64 {
        self.ratio * self.weight
    }
}

/// Scores one metric at `as_of`.
///
/// `history` and `snapshots` must belong to `metric`; their order does not
/// matter. The engine reads nothing else and writes nothing.
///
/// # Errors
/// Returns [`MetricError::InvalidRecord`] when the record's timestamps are
/// inconsistent or the supplied events belong to another record, and
/// [`MetricError::Configuration`] when the policy is invalid.
pub fn score_metric(
    metric: &Metric,
    history: &[HistoryEntry],
    snapshots: &[ScoreSnapshot],
    as_of: OffsetDateTime,
    policy: &ScoringPolicy,
) -> Result<TrustAssessment> {
    policy.validate()?;

    if metric.updated_at < metric.created_at {
        return Err(MetricError::InvalidRecord(format!(
            "metric {} has updated_at before created_at",
            metric.id
        )));
    }
    if let Some(entry) = history.iter().find(|entry| entry.metric_id != metric.id) {
        return Err(MetricError::InvalidRecord(format!(
            "history entry {} belongs to metric {}, not {}",
            entry.history_id, entry.metric_id, metric.id
        )));
    }
    if let Some(snapshot) = snapshots.iter().find(|s| s.metric_id != metric.id) {
        return Err(MetricError::InvalidRecord(format!(
            "score snapshot {} belongs to metric {}, not {}",
            snapshot.snapshot_id, snapshot.metric_id, metric.id
        )));
    }

    let idle_days = whole_days_between(metric.updated_at, as_of);
    let age_days = whole_days_between(metric.created_at, as_of);
    let missing_docs = documentation_gaps(metric, policy);

    let factors = base_factors(metric, idle_days, missing_docs.len(), policy);
    let base: f64 = factors.iter().map(|factor| factor.points()).sum();

    let decay = staleness_decay(age_days, idle_days, policy);
    let recent_activity = recent_activity_boost(idle_days, policy);
    let consistency = consistency_bonus(history, policy);

    // Only the reported values are rounded; the total uses the raw decay.
    let score = round_one_decimal((base + recent_activity + consistency - decay).clamp(0.0, 100.0));
    let adjustments = Adjustments {
        recent_activity,
        consistency,
        staleness_decay: if decay > 0.0 { -round_one_decimal(decay) } else { 0.0 },
    };
    let breakdown = ScoreBreakdown {
        freshness: round_one_decimal(factors[0].points()),
        tests: round_one_decimal(factors[1].points()),
        usage: round_one_decimal(factors[2].points()),
        documentation: round_one_decimal(factors[3].points()),
        ownership: round_one_decimal(factors[4].points()),
    };

    Ok(TrustAssessment {
        metric_id: metric.id.clone(),
        score,
        grade: ScoreGrade::from_score(score),
        breakdown,
        trend: classify_trend(history, snapshots.len(), as_of, policy),
        recommendations: recommendations(&factors, metric, idle_days, &missing_docs, policy),
        adjustments,
        days_since_update: idle_days,
        age_days,
        policy_version: policy.policy_version,
        evaluated_at: as_of,
    })
}

/// Renders a score series as block characters, oldest first.
#[must_use]
pub fn sparkline(scores: &[f64]) -> String {
    const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

    if scores.len() < 2 {
        return "─".to_string();
    }

    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    if span <= f64::EPSILON {
        return "▄".repeat(scores.len());
    }

    scores
        .iter()
        .map(|score| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let level = (((score - min) / span) * 8.0) as usize;
            BLOCKS[level.min(BLOCKS.len() - 1)]
        })
        .collect()
}

fn base_factors(
    metric: &Metric,
    idle_days: i64,
    missing_docs: usize,
    policy: &ScoringPolicy,
) -> [FactorScore; 5] {
    #[allow(clippy::cast_precision_loss)]
    let documentation = (DOCUMENTATION_CHECKS - missing_docs.min(DOCUMENTATION_CHECKS)) as f64
        / DOCUMENTATION_CHECKS as f64;

    [
        FactorScore {
            factor: Factor::Freshness,
            ratio: freshness_ratio(idle_days, &policy.freshness_tiers),
            weight: policy.weights.freshness,
        },
        FactorScore {
            factor: Factor::Tests,
            ratio: count_ratio(metric.test_count, &policy.test_tiers),
            weight: policy.weights.tests,
        },
        FactorScore {
            factor: Factor::Usage,
            ratio: count_ratio(metric.usage_count, &policy.usage_tiers),
            weight: policy.weights.usage,
        },
        FactorScore {
            factor: Factor::Documentation,
            ratio: documentation,
            weight: policy.weights.documentation,
        },
        FactorScore {
            factor: Factor::Ownership,
            ratio: if has_owner(metric, policy) { 1.0 } else { 0.0 },
            weight: policy.weights.ownership,
        },
    ]
}

const DOCUMENTATION_CHECKS: usize = 4;

fn freshness_ratio(idle_days: i64, tiers: &[ScoreTier]) -> f64 {
    tiers
        .iter()
        .find(|tier| idle_days <= i64::from(tier.bound))
        .map_or(0.0, |tier| tier.ratio)
}

fn count_ratio(count: u32, tiers: &[ScoreTier]) -> f64 {
    tiers
        .iter()
        .find(|tier| count >= tier.bound)
        .map_or(0.0, |tier| tier.ratio)
}

fn documentation_gaps(metric: &Metric, policy: &ScoringPolicy) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if metric.description.trim().chars().count() <= policy.description_min_chars {
        missing.push("description");
    }
    if !metric
        .data_source
        .as_deref()
        .is_some_and(|source| !source.trim().is_empty())
    {
        missing.push("data source");
    }
    if metric.tags.is_empty() {
        missing.push("tags");
    }
    if metric.dependencies.is_empty() {
        missing.push("dependencies");
    }
    missing
}

fn has_owner(metric: &Metric, policy: &ScoringPolicy) -> bool {
    metric.owner.as_deref().map(str::trim).is_some_and(|owner| {
        !owner.is_empty() && !owner.eq_ignore_ascii_case(&policy.unassigned_owner)
    })
}

fn recent_activity_boost(idle_days: i64, policy: &ScoringPolicy) -> f64 {
    if idle_days <= i64::from(policy.recent_boost_days) {
        policy.recent_boost
    } else if idle_days <= i64::from(policy.active_boost_days) {
        policy.active_boost
    } else {
        0.0
    }
}

fn consistency_bonus(history: &[HistoryEntry], policy: &ScoringPolicy) -> f64 {
    let mut stamps: Vec<OffsetDateTime> = history.iter().map(|entry| entry.changed_at).collect();
    stamps.sort_unstable_by(|a, b| b.cmp(a));
    stamps.truncate(policy.consistency_window);

    if stamps.len() < policy.consistency_min_entries {
        return 0.0;
    }

    let max_gap = i64::from(policy.consistency_max_gap_days);
    let steady = stamps
        .windows(2)
        .all(|pair| (pair[0] - pair[1]).whole_days() <= max_gap);

    if steady {
        policy.consistency_bonus
    } else {
        0.0
    }
}

fn staleness_decay(age_days: i64, idle_days: i64, policy: &ScoringPolicy) -> f64 {
    if age_days <= i64::from(policy.decay_min_age_days)
        || idle_days <= i64::from(policy.decay_min_idle_days)
    {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let periods = idle_days as f64 / f64::from(policy.decay_period_days);
    (periods * policy.decay_per_period).min(policy.decay_cap)
}

fn classify_trend(
    history: &[HistoryEntry],
    snapshot_count: usize,
    as_of: OffsetDateTime,
    policy: &ScoringPolicy,
) -> Trend {
    if snapshot_count < 2 {
        return Trend::Stable;
    }

    let window = Duration::days(i64::from(policy.trend_window_days));
    let mut recent: i64 = 0;
    let mut prior: i64 = 0;
    for entry in history {
        let age = as_of - entry.changed_at;
        if age <= window {
            recent += 1;
        } else if age <= window * 2 {
            prior += 1;
        }
    }

    let threshold = i64::from(policy.trend_threshold);
    if recent > prior + threshold {
        Trend::Improving
    } else if recent < prior - threshold {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn recommendations(
    factors: &[FactorScore],
    metric: &Metric,
    idle_days: i64,
    missing_docs: &[&str],
    policy: &ScoringPolicy,
) -> Vec<Recommendation> {
    let mut deficient: Vec<FactorScore> = factors
        .iter()
        .copied()
        .filter(|factor| factor.points() < factor.weight * policy.deficiency_ratio)
        .collect();

    deficient.sort_by(|a, b| {
        a.ratio
            .total_cmp(&b.ratio)
            .then_with(|| b.weight.total_cmp(&a.weight))
    });

    deficient
        .into_iter()
        .take(policy.max_recommendations)
        .map(|factor| Recommendation {
            factor: factor.factor,
            message: recommendation_message(factor.factor, metric, idle_days, missing_docs, policy),
        })
        .collect()
}

fn recommendation_message(
    factor: Factor,
    metric: &Metric,
    idle_days: i64,
    missing_docs: &[&str],
    policy: &ScoringPolicy,
) -> String {
    match factor {
        Factor::Tests if metric.test_count == 0 => format!(
            "Critical: no passing validation tests; add at least {}",
            policy.expected_test_coverage()
        ),
        Factor::Tests => format!(
            "Add validation tests: {} passing, {} expected",
            metric.test_count,
            policy.expected_test_coverage()
        ),
        Factor::Usage if metric.usage_count == 0 => {
            "No recorded usage yet; share the metric with its intended consumers".to_string()
        }
        Factor::Usage => format!(
            "Low adoption ({} uses); confirm the metric is still needed",
            metric.usage_count
        ),
        Factor::Freshness => {
            format!("Not updated in {idle_days} days; review the definition for staleness")
        }
        Factor::Documentation => format!(
            "Complete the documentation: missing {}",
            missing_docs.join(", ")
        ),
        Factor::Ownership => "Assign an owner accountable for this metric".to_string(),
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_rfc3339_utc, MetricField};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn as_of() -> OffsetDateTime {
        must(parse_rfc3339_utc("2026-06-01T12:00:00Z"))
    }

    fn fixture_metric() -> Metric {
        Metric {
            id: "active_users".to_string(),
            name: "Active users".to_string(),
            description: String::new(),
            calculation: "COUNT(DISTINCT user_id)".to_string(),
            owner: None,
            data_source: None,
            tags: BTreeSet::new(),
            dependencies: Vec::new(),
            test_count: 0,
            usage_count: 0,
            created_at: as_of(),
            updated_at: as_of(),
            trust_score: 0.0,
        }
    }

    fn documented_metric() -> Metric {
        let mut metric = fixture_metric();
        metric.description = "Distinct users with a session in the trailing 28 days".to_string();
        metric.owner = Some("growth".to_string());
        metric.data_source = Some("events.sessions".to_string());
        metric.tags = ["engagement".to_string()].into_iter().collect();
        metric.dependencies = vec!["sessions".to_string()];
        metric
    }

    fn entry_days_ago(metric_id: &str, days: i64) -> HistoryEntry {
        HistoryEntry {
            history_id: days,
            change_id: Ulid::new(),
            metric_id: metric_id.to_string(),
            field: MetricField::Description,
            old_value: Value::Null,
            new_value: Value::Null,
            actor: Some("tester".to_string()),
            changed_at: as_of() - Duration::days(days),
        }
    }

    fn snapshot(metric_id: &str, id: i64) -> ScoreSnapshot {
        ScoreSnapshot {
            snapshot_id: id,
            metric_id: metric_id.to_string(),
            score: 50.0,
            breakdown: json!({}),
            recorded_at: as_of() - Duration::days(id),
        }
    }

    fn score(
        metric: &Metric,
        history: &[HistoryEntry],
        snapshots: &[ScoreSnapshot],
    ) -> TrustAssessment {
        must(score_metric(metric, history, snapshots, as_of(), &ScoringPolicy::v1()))
    }

    fn aged(mut metric: Metric, age_days: i64, idle_days: i64) -> Metric {
        metric.created_at = as_of() - Duration::days(age_days);
        metric.updated_at = as_of() - Duration::days(idle_days);
        metric
    }

    #[test]
    fn freshness_tiers_include_their_bound() {
        for (idle, points) in [
            (7, 15.0),
            (8, 11.3),
            (30, 11.3),
            (31, 7.5),
            (90, 7.5),
            (91, 3.8),
            (180, 3.8),
            (181, 0.0),
        ] {
            let assessment = score(&aged(fixture_metric(), idle, idle), &[], &[]);
            assert!(
                (assessment.breakdown.freshness - points).abs() < 1e-9,
                "idle {idle}: freshness {}",
                assessment.breakdown.freshness
            );
        }
    }

    #[test]
    fn recency_boost_steps_down_after_each_window() {
        for (idle, boost) in [(0, 10.0), (7, 10.0), (8, 5.0), (30, 5.0), (31, 0.0)] {
            let assessment = score(&aged(fixture_metric(), idle, idle), &[], &[]);
            assert!(
                (assessment.adjustments.recent_activity - boost).abs() < 1e-9,
                "idle {idle}: boost {}",
                assessment.adjustments.recent_activity
            );
        }
    }

    #[test]
    fn decay_below_the_cap_is_fractional() {
        let assessment = score(&aged(documented_metric(), 400, 45), &[], &[]);
        assert!((assessment.adjustments.staleness_decay + 7.5).abs() < 1e-9);
        // 7.5 freshness + 15 documentation + 15 ownership - 7.5 decay
        assert!((assessment.score - 30.0).abs() < 1e-9, "score {}", assessment.score);
    }

    #[test]
    fn decay_needs_both_age_and_idleness() {
        let young = score(&aged(documented_metric(), 90, 60), &[], &[]);
        assert!(young.adjustments.staleness_decay.abs() < 1e-9);
        let recently_touched = score(&aged(documented_metric(), 400, 30), &[], &[]);
        assert!(recently_touched.adjustments.staleness_decay.abs() < 1e-9);
        let idle = score(&aged(documented_metric(), 400, 31), &[], &[]);
        assert!(idle.adjustments.staleness_decay < 0.0);
    }

    #[test]
    fn total_uses_unrounded_decay() {
        let mut metric = aged(fixture_metric(), 400, 32);
        metric.tags = ["finance".to_string()].into_iter().collect();
        let assessment = score(&metric, &[], &[]);

        // 7.5 freshness + 3.75 documentation - 32/30*5 decay = 5.9166...
        assert!((assessment.adjustments.staleness_decay + 5.3).abs() < 1e-9);
        assert!((assessment.score - 5.9).abs() < 1e-9, "score {}", assessment.score);
    }

    #[test]
    fn new_undocumented_metric_scores_at_most_fifty() {
        let assessment = score(&fixture_metric(), &[], &[]);
        assert!(assessment.score <= 50.0, "score {}", assessment.score);
        assert!((assessment.score - 25.0).abs() < 1e-9);
        assert_eq!(assessment.grade, ScoreGrade::Poor);
    }

    #[test]
    fn passing_tests_and_owner_raise_the_score() {
        let baseline = score(&fixture_metric(), &[], &[]);

        let mut improved = fixture_metric();
        improved.test_count = 4;
        improved.owner = Some("analytics".to_string());
        let assessment = score(&improved, &[], &[]);

        assert!(assessment.score > baseline.score);
        assert!((assessment.breakdown.tests - 28.0).abs() < 1e-9);
        assert!((assessment.breakdown.ownership - 15.0).abs() < 1e-9);
    }

    #[test]
    fn unassigned_owner_earns_no_ownership_points() {
        let mut metric = fixture_metric();
        metric.owner = Some("unassigned".to_string());
        assert!(score(&metric, &[], &[]).breakdown.ownership.abs() < 1e-9);
    }

    #[test]
    fn stale_metric_decays_below_fresh_copy() {
        let mut stale = documented_metric();
        stale.test_count = 5;
        stale.created_at = as_of() - Duration::days(300);
        stale.updated_at = as_of() - Duration::days(200);

        let mut fresh = stale.clone();
        fresh.updated_at = as_of();

        let stale_assessment = score(&stale, &[], &[]);
        let fresh_assessment = score(&fresh, &[], &[]);

        assert!(stale_assessment.adjustments.staleness_decay < 0.0);
        assert!((stale_assessment.adjustments.staleness_decay + 25.0).abs() < 1e-9);
        assert!(fresh_assessment.adjustments.staleness_decay.abs() < 1e-9);
        assert!(stale_assessment.score < fresh_assessment.score);
    }

    #[test]
    fn decay_requires_both_age_and_idleness() {
        let mut young = documented_metric();
        young.created_at = as_of() - Duration::days(60);
        young.updated_at = as_of() - Duration::days(59);
        assert!(score(&young, &[], &[]).adjustments.staleness_decay.abs() < 1e-9);

        let mut old_but_busy = documented_metric();
        old_but_busy.created_at = as_of() - Duration::days(400);
        old_but_busy.updated_at = as_of() - Duration::days(10);
        assert!(score(&old_but_busy, &[], &[]).adjustments.staleness_decay.abs() < 1e-9);
    }

    #[test]
    fn trend_is_stable_with_fewer_than_two_snapshots() {
        let metric = fixture_metric();
        let history: Vec<HistoryEntry> = (0..8).map(|d| entry_days_ago(&metric.id, d)).collect();
        let assessment = score(&metric, &history, &[snapshot(&metric.id, 1)]);
        assert_eq!(assessment.trend, Trend::Stable);
    }

    #[test]
    fn trend_compares_recent_and_prior_activity() {
        let metric = fixture_metric();
        let snapshots = [snapshot(&metric.id, 1), snapshot(&metric.id, 2)];

        let busy_recently: Vec<HistoryEntry> =
            (0..6).map(|d| entry_days_ago(&metric.id, d)).collect();
        assert_eq!(score(&metric, &busy_recently, &snapshots).trend, Trend::Improving);

        let busy_before: Vec<HistoryEntry> =
            (40..46).map(|d| entry_days_ago(&metric.id, d)).collect();
        assert_eq!(score(&metric, &busy_before, &snapshots).trend, Trend::Degrading);

        let even: Vec<HistoryEntry> = [1, 2, 35, 36]
            .into_iter()
            .map(|d| entry_days_ago(&metric.id, d))
            .collect();
        assert_eq!(score(&metric, &even, &snapshots).trend, Trend::Stable);
    }

    #[test]
    fn regular_history_earns_consistency_bonus() {
        let metric = fixture_metric();
        let history: Vec<HistoryEntry> = [0, 5, 10, 15, 20, 25]
            .into_iter()
            .map(|d| entry_days_ago(&metric.id, d))
            .collect();
        assert!((score(&metric, &history, &[]).adjustments.consistency - 5.0).abs() < 1e-9);
    }

    #[test]
    fn long_gap_or_short_history_forfeits_consistency_bonus() {
        let metric = fixture_metric();
        let gapped: Vec<HistoryEntry> = [0, 5, 10, 15, 50]
            .into_iter()
            .map(|d| entry_days_ago(&metric.id, d))
            .collect();
        assert!(score(&metric, &gapped, &[]).adjustments.consistency.abs() < 1e-9);

        let short: Vec<HistoryEntry> = [0, 5, 10, 15]
            .into_iter()
            .map(|d| entry_days_ago(&metric.id, d))
            .collect();
        assert!(score(&metric, &short, &[]).adjustments.consistency.abs() < 1e-9);
    }

    #[test]
    fn consistency_only_inspects_the_ten_most_recent_entries() {
        let metric = fixture_metric();
        let mut history: Vec<HistoryEntry> =
            (0..10).map(|d| entry_days_ago(&metric.id, d * 3)).collect();
        history.push(entry_days_ago(&metric.id, 400));
        assert!((score(&metric, &history, &[]).adjustments.consistency - 5.0).abs() < 1e-9);
    }

    #[test]
    fn recommendations_order_by_ratio_then_weight() {
        let assessment = score(&fixture_metric(), &[], &[]);
        let factors: Vec<Factor> = assessment.recommendations.iter().map(|r| r.factor).collect();
        assert_eq!(factors, vec![Factor::Tests, Factor::Usage, Factor::Documentation]);
        assert!(assessment.recommendations[0].message.starts_with("Critical"));
    }

    #[test]
    fn recommendations_respect_the_cap() {
        let mut policy = ScoringPolicy::v1();
        policy.max_recommendations = 1;
        let assessment = must(score_metric(&fixture_metric(), &[], &[], as_of(), &policy));
        assert_eq!(assessment.recommendations.len(), 1);
    }

    #[test]
    fn updated_before_created_is_rejected() {
        let mut metric = fixture_metric();
        metric.updated_at = metric.created_at - Duration::seconds(1);
        assert!(matches!(
            score_metric(&metric, &[], &[], as_of(), &ScoringPolicy::v1()),
            Err(MetricError::InvalidRecord(_))
        ));
    }

    #[test]
    fn foreign_history_is_rejected() {
        let metric = fixture_metric();
        let foreign = entry_days_ago("other", 1);
        assert!(matches!(
            score_metric(&metric, &[foreign], &[], as_of(), &ScoringPolicy::v1()),
            Err(MetricError::InvalidRecord(_))
        ));
    }

    #[test]
    fn fully_invested_metric_is_excellent() {
        let mut metric = documented_metric();
        metric.test_count = 6;
        metric.usage_count = 75;
        let assessment = score(&metric, &[], &[]);
        assert!((assessment.score - 100.0).abs() < 1e-9);
        assert_eq!(assessment.grade, ScoreGrade::Excellent);
        assert!(assessment.recommendations.is_empty());
    }

    #[test]
    fn breakdown_json_carries_factors_and_adjustments() {
        let value = score(&documented_metric(), &[], &[]).breakdown_json();
        assert_eq!(value["factors"]["ownership"], json!(15.0));
        assert_eq!(value["adjustments"]["recent_activity"], json!(10.0));
        assert_eq!(value["trend"], json!("stable"));
    }

    #[test]
    fn sparkline_handles_short_flat_and_varied_series() {
        assert_eq!(sparkline(&[]), "─");
        assert_eq!(sparkline(&[42.0]), "─");
        assert_eq!(sparkline(&[50.0, 50.0, 50.0]), "▄▄▄");
        assert_eq!(sparkline(&[0.0, 50.0, 100.0]), "▁▅█");
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(ScoreGrade::from_score(80.0), ScoreGrade::Excellent);
        assert_eq!(ScoreGrade::from_score(79.9), ScoreGrade::Good);
        assert_eq!(ScoreGrade::from_score(40.0), ScoreGrade::Fair);
        assert_eq!(ScoreGrade::from_score(0.0), ScoreGrade::Poor);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_score_stays_within_bounds(
            test_count in 0u32..40,
            usage_count in 0u32..200,
            created_days_ago in 0i64..2_000,
            idle_fraction in 0.0f64..=1.0,
            owned in any::<bool>(),
            history_days in prop::collection::vec(0i64..400, 0..30),
        ) {
            let mut metric = documented_metric();
            metric.test_count = test_count;
            metric.usage_count = usage_count;
            if !owned {
                metric.owner = None;
            }
            metric.created_at = as_of() - Duration::days(created_days_ago);
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            let idle = (created_days_ago as f64 * idle_fraction) as i64;
            metric.updated_at = as_of() - Duration::days(idle);

            let history: Vec<HistoryEntry> = history_days
                .iter()
                .map(|d| entry_days_ago(&metric.id, *d))
                .collect();
            let snapshots = [snapshot(&metric.id, 1), snapshot(&metric.id, 2)];

            let assessment = score(&metric, &history, &snapshots);
            prop_assert!(assessment.score.is_finite());
            prop_assert!((0.0..=100.0).contains(&assessment.score));
            prop_assert!(assessment.adjustments.staleness_decay <= 0.0);
            prop_assert!(assessment.recommendations.len() <= 3);
        }
    }
}
