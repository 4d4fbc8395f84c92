use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MetricError, Result};

/// Points awarded to each base factor. The five weights sum to 100.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorWeights {
    pub freshness: f64,
    pub tests: f64,
    pub usage: f64,
    pub documentation: f64,
    pub ownership: f64,
}

impl FactorWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.freshness + self.tests + self.usage + self.documentation + self.ownership
    }
}

/// One step of a tiered factor. For freshness `bound` is an upper limit on
/// days since update; for counts it is a lower limit on the count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreTier {
    pub bound: u32,
    pub ratio: f64,
}

impl ScoreTier {
    const fn new(bound: u32, ratio: f64) -> Self {
        Self { bound, ratio }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringPolicy {
    pub policy_version: u32,
    pub weights: FactorWeights,
    /// Ascending day limits; the first tier whose bound is not exceeded wins.
    pub freshness_tiers: Vec<ScoreTier>,
    /// Descending minimum counts; the first tier reached wins.
    pub test_tiers: Vec<ScoreTier>,
    pub usage_tiers: Vec<ScoreTier>,
    pub description_min_chars: usize,
    pub unassigned_owner: String,
    pub recent_boost_days: u32,
    pub recent_boost: f64,
    pub active_boost_days: u32,
    pub active_boost: f64,
    pub consistency_window: usize,
    pub consistency_min_entries: usize,
    pub consistency_max_gap_days: u32,
    pub consistency_bonus: f64,
    pub decay_min_age_days: u32,
    pub decay_min_idle_days: u32,
    pub decay_period_days: u32,
    pub decay_per_period: f64,
    pub decay_cap: f64,
    pub trend_window_days: u32,
    pub trend_threshold: u32,
    pub deficiency_ratio: f64,
    pub max_recommendations: usize,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::v1()
    }
}

impl ScoringPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            policy_version: 1,
            weights: FactorWeights {
                freshness: 15.0,
                tests: 35.0,
                usage: 20.0,
                documentation: 15.0,
                ownership: 15.0,
            },
            freshness_tiers: vec![
                ScoreTier::new(7, 1.0),
                ScoreTier::new(30, 0.75),
                ScoreTier::new(90, 0.5),
                ScoreTier::new(180, 0.25),
            ],
            test_tiers: vec![
                ScoreTier::new(5, 1.0),
                ScoreTier::new(3, 0.8),
                ScoreTier::new(1, 0.6),
            ],
            usage_tiers: vec![
                ScoreTier::new(50, 1.0),
                ScoreTier::new(20, 0.75),
                ScoreTier::new(10, 0.5),
                ScoreTier::new(1, 0.25),
            ],
            description_min_chars: 20,
            unassigned_owner: "Unassigned".to_string(),
            recent_boost_days: 7,
            recent_boost: 10.0,
            active_boost_days: 30,
            active_boost: 5.0,
            consistency_window: 10,
            consistency_min_entries: 5,
            consistency_max_gap_days: 30,
            consistency_bonus: 5.0,
            decay_min_age_days: 90,
            decay_min_idle_days: 30,
            decay_period_days: 30,
            decay_per_period: 5.0,
            decay_cap: 25.0,
            trend_window_days: 30,
            trend_threshold: 2,
            deficiency_ratio: 0.5,
            max_recommendations: 3,
        }
    }

    /// Target test count: the bound of the highest test tier.
    #[must_use]
    pub fn expected_test_coverage(&self) -> u32 {
        self.test_tiers.first().map_or(0, |tier| tier.bound)
    }

    /// Validates weights, tier ordering and window bounds.
    ///
    /// # Errors
    /// Returns [`MetricError::Configuration`] when one or more policy fields
    /// are outside allowed bounds.
    pub fn validate(&self) -> Result<()> {
        if self.policy_version == 0 {
            return Err(MetricError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("weights.freshness", self.weights.freshness),
            ("weights.tests", self.weights.tests),
            ("weights.usage", self.weights.usage),
            ("weights.documentation", self.weights.documentation),
            ("weights.ownership", self.weights.ownership),
            ("recent_boost", self.recent_boost),
            ("active_boost", self.active_boost),
            ("consistency_bonus", self.consistency_bonus),
            ("decay_per_period", self.decay_per_period),
            ("decay_cap", self.decay_cap),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MetricError::Configuration(format!(
                    "{name} MUST be a finite, non-negative number"
                )));
            }
        }

        if (self.weights.total() - 100.0).abs() > 1e-6 {
            return Err(MetricError::Configuration(format!(
                "factor weights MUST sum to 100, got {}",
                self.weights.total()
            )));
        }

        validate_tiers("freshness_tiers", &self.freshness_tiers, TierOrder::Ascending)?;
        validate_tiers("test_tiers", &self.test_tiers, TierOrder::Descending)?;
        validate_tiers("usage_tiers", &self.usage_tiers, TierOrder::Descending)?;

        if !(0.0..=1.0).contains(&self.deficiency_ratio) {
            return Err(MetricError::Configuration(
                "deficiency_ratio MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        if self.recent_boost_days > self.active_boost_days {
            return Err(MetricError::Configuration(
                "recent_boost_days cannot exceed active_boost_days".to_string(),
            ));
        }

        if self.consistency_window == 0
            || self.consistency_min_entries < 2
            || self.consistency_min_entries > self.consistency_window
        {
            return Err(MetricError::Configuration(
                "consistency_min_entries MUST be in [2, consistency_window]".to_string(),
            ));
        }

        if self.decay_period_days == 0 || self.trend_window_days == 0 {
            return Err(MetricError::Configuration(
                "decay_period_days and trend_window_days MUST be >= 1".to_string(),
            ));
        }

        if self.unassigned_owner.trim().is_empty() {
            return Err(MetricError::Configuration(
                "unassigned_owner MUST be provided".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`MetricError::Configuration`] when JSON decoding fails or
    /// decoded values violate policy constraints.
    pub fn from_json(value: &Value) -> Result<Self> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            MetricError::Configuration(format!("invalid scoring policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Clone, Copy)]
enum TierOrder {
    Ascending,
    Descending,
}

fn validate_tiers(name: &str, tiers: &[ScoreTier], order: TierOrder) -> Result<()> {
    if tiers.is_empty() {
        return Err(MetricError::Configuration(format!(
            "{name} MUST contain at least one tier"
        )));
    }

    for tier in tiers {
        if !(0.0..=1.0).contains(&tier.ratio) {
            return Err(MetricError::Configuration(format!(
                "{name} ratios MUST be in [0.0, 1.0]"
            )));
        }
    }

    for pair in tiers.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        let ordered = match order {
            TierOrder::Ascending => first.bound < second.bound,
            TierOrder::Descending => first.bound > second.bound,
        };
        if !ordered || first.ratio < second.ratio {
            return Err(MetricError::Configuration(format!(
                "{name} MUST be strictly ordered with non-increasing ratios"
            )));
        }
    }

    Ok(())
}
