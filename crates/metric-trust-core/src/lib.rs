//! Domain model for audit-tracked metric records and their trust scores.
//!
//! This crate is pure: it owns the record shapes, the error taxonomy shared by
//! every layer, the scoring policy and the scoring engine. Persistence lives in
//! `metric-trust-store-sqlite`.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod policy;
mod scoring;

pub use policy::{FactorWeights, ScoreTier, ScoringPolicy};
pub use scoring::{
    score_metric, sparkline, Adjustments, Factor, Recommendation, ScoreBreakdown, ScoreGrade,
    Trend, TrustAssessment,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MetricError {
    #[error("metric not found: {id}")]
    NotFound { id: String },
    #[error("metric already exists: {id}")]
    DuplicateKey { id: String },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MetricError {
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}

pub type Result<T, E = MetricError> = std::result::Result<T, E>;

/// A quality-governed record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub id: String,
    pub name: String,
    pub description: String,
    pub calculation: String,
    pub owner: Option<String>,
    pub data_source: Option<String>,
    pub tags: BTreeSet<String>,
    pub dependencies: Vec<String>,
    pub test_count: u32,
    pub usage_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub trust_score: f64,
}

impl Metric {
    #[must_use]
    pub fn field_value(&self, field: MetricField) -> Value {
        match field {
            MetricField::Name => Value::String(self.name.clone()),
            MetricField::Description => Value::String(self.description.clone()),
            MetricField::Calculation => Value::String(self.calculation.clone()),
            MetricField::Owner => optional_string_value(self.owner.as_deref()),
            MetricField::DataSource => optional_string_value(self.data_source.as_deref()),
            MetricField::Tags => Value::Array(
                self.tags
                    .iter()
                    .map(|tag| Value::String(tag.clone()))
                    .collect(),
            ),
            MetricField::Dependencies => Value::Array(
                self.dependencies
                    .iter()
                    .map(|dep| Value::String(dep.clone()))
                    .collect(),
            ),
        }
    }

    /// Computes the per-field diff a change set would produce, without
    /// applying it. Fields whose new value equals the current one are omitted.
    #[must_use]
    pub fn diff(&self, changes: &MetricChanges) -> Vec<FieldDiff> {
        changes
            .iter()
            .filter_map(|change| {
                let field = change.field();
                let old_value = self.field_value(field);
                let new_value = change.to_value();
                (old_value != new_value).then_some(FieldDiff {
                    field,
                    old_value,
                    new_value,
                })
            })
            .collect()
    }

    pub fn apply(&mut self, change: &FieldChange) {
        match change {
            FieldChange::Name(value) => self.name.clone_from(value),
            FieldChange::Description(value) => self.description.clone_from(value),
            FieldChange::Calculation(value) => self.calculation.clone_from(value),
            FieldChange::Owner(value) => self.owner.clone_from(value),
            FieldChange::DataSource(value) => self.data_source.clone_from(value),
            FieldChange::Tags(value) => self.tags.clone_from(value),
            FieldChange::Dependencies(value) => self.dependencies.clone_from(value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NewMetric {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub calculation: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl NewMetric {
    /// Validates a record before its first insert.
    ///
    /// # Errors
    /// Returns [`MetricError::InvalidRecord`] when a required field is blank
    /// or a collection holds blank or self-referencing entries.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(MetricError::InvalidRecord(
                "id MUST be provided".to_string(),
            ));
        }
        if self.id.trim() != self.id {
            return Err(MetricError::InvalidRecord(
                "id MUST NOT carry leading or trailing whitespace".to_string(),
            ));
        }
        require_text("name", &self.name)?;
        require_text("calculation", &self.calculation)?;
        validate_optional_text("owner", self.owner.as_deref())?;
        validate_optional_text("data_source", self.data_source.as_deref())?;
        validate_tags(&self.tags)?;
        validate_dependencies(&self.id, &self.dependencies)
    }

    #[must_use]
    pub fn into_metric(self, now: OffsetDateTime) -> Metric {
        Metric {
            id: self.id,
            name: self.name,
            description: self.description,
            calculation: self.calculation,
            owner: self.owner,
            data_source: self.data_source,
            tags: self.tags,
            dependencies: self.dependencies,
            test_count: 0,
            usage_count: 0,
            created_at: now,
            updated_at: now,
            trust_score: 0.0,
        }
    }
}

/// Fields a caller may change through an update. Counters, timestamps and the
/// cached score are maintained by the store and are never listed here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Name,
    Description,
    Calculation,
    Owner,
    DataSource,
    Tags,
    Dependencies,
}

impl MetricField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Description => "description",
            Self::Calculation => "calculation",
            Self::Owner => "owner",
            Self::DataSource => "data_source",
            Self::Tags => "tags",
            Self::Dependencies => "dependencies",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "name" => Some(Self::Name),
            "description" => Some(Self::Description),
            "calculation" => Some(Self::Calculation),
            "owner" => Some(Self::Owner),
            "data_source" => Some(Self::DataSource),
            "tags" => Some(Self::Tags),
            "dependencies" => Some(Self::Dependencies),
            _ => None,
        }
    }
}

impl Display for MetricField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const MAINTAINED_FIELDS: [&str; 6] = [
    "id",
    "test_count",
    "usage_count",
    "trust_score",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange {
    Name(String),
    Description(String),
    Calculation(String),
    Owner(Option<String>),
    DataSource(Option<String>),
    Tags(BTreeSet<String>),
    Dependencies(Vec<String>),
}

impl FieldChange {
    #[must_use]
    pub fn field(&self) -> MetricField {
        match self {
            Self::Name(_) => MetricField::Name,
            Self::Description(_) => MetricField::Description,
            Self::Calculation(_) => MetricField::Calculation,
            Self::Owner(_) => MetricField::Owner,
            Self::DataSource(_) => MetricField::DataSource,
            Self::Tags(_) => MetricField::Tags,
            Self::Dependencies(_) => MetricField::Dependencies,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Name(value) | Self::Description(value) | Self::Calculation(value) => {
                Value::String(value.clone())
            }
            Self::Owner(value) | Self::DataSource(value) => optional_string_value(value.as_deref()),
            Self::Tags(values) => {
                Value::Array(values.iter().map(|v| Value::String(v.clone())).collect())
            }
            Self::Dependencies(values) => {
                Value::Array(values.iter().map(|v| Value::String(v.clone())).collect())
            }
        }
    }

    fn from_value(field: MetricField, value: &Value) -> Result<Self> {
        let change = match field {
            MetricField::Name => Self::Name(expect_string(field, value)?),
            MetricField::Description => Self::Description(expect_string(field, value)?),
            MetricField::Calculation => Self::Calculation(expect_string(field, value)?),
            MetricField::Owner => Self::Owner(expect_optional_string(field, value)?),
            MetricField::DataSource => Self::DataSource(expect_optional_string(field, value)?),
            MetricField::Tags => {
                Self::Tags(expect_string_array(field, value)?.into_iter().collect())
            }
            MetricField::Dependencies => Self::Dependencies(expect_string_array(field, value)?),
        };
        Ok(change)
    }
}

/// A set of field assignments applied by one update call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricChanges {
    changes: Vec<FieldChange>,
}

impl MetricChanges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, change: FieldChange) -> Self {
        self.changes.push(change);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter()
    }

    /// Decodes a JSON object of `field -> value` assignments.
    ///
    /// # Errors
    /// Returns [`MetricError::InvalidRecord`] when the payload is not an
    /// object, names an unknown or store-maintained field, or carries a value
    /// of the wrong shape.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(MetricError::InvalidRecord(
                "changes MUST be a JSON object".to_string(),
            ));
        };

        let mut changes = Self::new();
        for (name, raw) in map {
            let Some(field) = MetricField::parse(name) else {
                if MAINTAINED_FIELDS.contains(&name.as_str()) {
                    return Err(MetricError::InvalidRecord(format!(
                        "field {name} is maintained by the store and cannot be updated"
                    )));
                }
                return Err(MetricError::InvalidRecord(format!("unknown field: {name}")));
            };
            changes = changes.with(FieldChange::from_value(field, raw)?);
        }
        Ok(changes)
    }

    /// Validates every assignment against the same rules as [`NewMetric`].
    ///
    /// # Errors
    /// Returns [`MetricError::InvalidRecord`] for duplicate fields, blank
    /// required text, or invalid collection entries.
    pub fn validate(&self, metric_id: &str) -> Result<()> {
        let mut seen = BTreeSet::new();
        for change in &self.changes {
            if !seen.insert(change.field()) {
                return Err(MetricError::InvalidRecord(format!(
                    "field {} assigned more than once",
                    change.field()
                )));
            }
            match change {
                FieldChange::Name(value) => require_text("name", value)?,
                FieldChange::Calculation(value) => require_text("calculation", value)?,
                FieldChange::Description(_) => {}
                FieldChange::Owner(value) => validate_optional_text("owner", value.as_deref())?,
                FieldChange::DataSource(value) => {
                    validate_optional_text("data_source", value.as_deref())?;
                }
                FieldChange::Tags(tags) => validate_tags(tags)?,
                FieldChange::Dependencies(deps) => validate_dependencies(metric_id, deps)?,
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MetricChanges {
    type Item = &'a FieldChange;
    type IntoIter = std::slice::Iter<'a, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDiff {
    pub field: MetricField,
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub history_id: i64,
    pub change_id: Ulid,
    pub metric_id: String,
    pub field: MetricField,
    pub old_value: Value,
    pub new_value: Value,
    pub actor: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Unknown,
}

impl TestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationTestInput {
    pub test_type: String,
    pub expression: String,
    pub expected_result: String,
    pub status: TestStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
}

impl ValidationTestInput {
    /// # Errors
    /// Returns [`MetricError::InvalidRecord`] when the test type or expression
    /// is blank, or when a run timestamp is not UTC.
    pub fn validate(&self) -> Result<()> {
        require_text("test_type", &self.test_type)?;
        require_text("expression", &self.expression)?;
        if let Some(last_run) = self.last_run {
            if last_run.offset() != UtcOffset::UTC {
                return Err(MetricError::InvalidRecord(
                    "last_run MUST be UTC (offset Z)".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationTest {
    pub test_id: i64,
    pub metric_id: String,
    pub test_type: String,
    pub expression: String,
    pub expected_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageEvent {
    pub usage_id: i64,
    pub metric_id: String,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageStats {
    pub metric_id: String,
    pub window_days: u32,
    pub total_uses: u64,
    pub unique_users: u64,
    pub unique_contexts: u64,
    pub events: Vec<UsageEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSnapshot {
    pub snapshot_id: i64,
    pub metric_id: String,
    pub score: f64,
    pub breakdown: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Row counts removed by a cascading delete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct DeleteReport {
    pub history_entries: u64,
    pub validation_tests: u64,
    pub usage_events: u64,
    pub score_snapshots: u64,
}

fn optional_string_value(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |inner| Value::String(inner.to_string()))
}

fn require_text(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MetricError::InvalidRecord(format!(
            "{name} MUST be provided"
        )));
    }
    Ok(())
}

fn validate_optional_text(name: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(inner) if inner.trim().is_empty() => Err(MetricError::InvalidRecord(format!(
            "{name} MUST be non-empty when provided"
        ))),
        _ => Ok(()),
    }
}

fn validate_tags(tags: &BTreeSet<String>) -> Result<()> {
    if tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(MetricError::InvalidRecord(
            "tags MUST NOT contain blank entries".to_string(),
        ));
    }
    Ok(())
}

fn validate_dependencies(metric_id: &str, dependencies: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for dependency in dependencies {
        if dependency.trim().is_empty() {
            return Err(MetricError::InvalidRecord(
                "dependencies MUST NOT contain blank entries".to_string(),
            ));
        }
        if dependency == metric_id {
            return Err(MetricError::InvalidRecord(format!(
                "metric {metric_id} cannot depend on itself"
            )));
        }
        if !seen.insert(dependency.as_str()) {
            return Err(MetricError::InvalidRecord(format!(
                "dependency {dependency} listed more than once"
            )));
        }
    }
    Ok(())
}

fn expect_string(field: MetricField, value: &Value) -> Result<String> {
    value.as_str().map(ToString::to_string).ok_or_else(|| {
        MetricError::InvalidRecord(format!("field {field} MUST be a string"))
    })
}

fn expect_optional_string(field: MetricField, value: &Value) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    expect_string(field, value).map(Some)
}

fn expect_string_array(field: MetricField, value: &Value) -> Result<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(MetricError::InvalidRecord(format!(
            "field {field} MUST be an array of strings"
        )));
    };
    items
        .iter()
        .map(|item| expect_string(field, item))
        .collect()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`MetricError::InvalidRecord`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| MetricError::InvalidRecord(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(MetricError::InvalidRecord(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MetricError::InvalidRecord`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| MetricError::InvalidRecord(format!("failed to format timestamp: {err}")))
}

/// Formats a timestamp with a fixed six-digit fraction so that stored text
/// sorts in chronological order.
///
/// # Errors
/// Returns [`MetricError::InvalidRecord`] when formatting fails.
pub fn format_storage_timestamp(value: OffsetDateTime) -> Result<String> {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    truncate_to_micros(value.to_offset(UtcOffset::UTC))
        .format(&format)
        .map_err(|err| MetricError::InvalidRecord(format!("failed to format timestamp: {err}")))
}

/// Current UTC instant at the precision the store persists.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_micros(OffsetDateTime::now_utc())
}

#[must_use]
pub fn truncate_to_micros(value: OffsetDateTime) -> OffsetDateTime {
    let nanos = value.nanosecond();
    value
        .replace_nanosecond(nanos - nanos % 1_000)
        .unwrap_or(value)
}

/// Whole days elapsed from `earlier` to `later`; zero when `later` is not
/// after `earlier`.
#[must_use]
pub fn whole_days_between(earlier: OffsetDateTime, later: OffsetDateTime) -> i64 {
    if later <= earlier {
        return 0;
    }
    (later - earlier).whole_days()
}

#[must_use]
pub fn days_ago(as_of: OffsetDateTime, days: u32) -> OffsetDateTime {
    as_of - Duration::days(i64::from(days))
}
