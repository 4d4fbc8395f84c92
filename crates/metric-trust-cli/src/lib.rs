//! Embeddable command surface for the metric trust registry.
//!
//! Hosts can drive the registry through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for a single [`Command`] against a DB path.
//! - [`execute`] for a [`Command`] against an open [`SqliteMetricStore`],
//!   returning the JSON document the CLI would print.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metric_trust_core::{
    now_utc, parse_rfc3339_utc, sparkline, MetricChanges, NewMetric, ScoringPolicy, TestStatus,
    ValidationTestInput,
};
use metric_trust_store_sqlite::{ScoreRecorder, SqliteMetricStore, StoreConfig};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "mt")]
#[command(about = "Metric trust registry CLI")]
pub struct Cli {
    #[arg(long, default_value = "./metric_trust.sqlite3")]
    db: PathBuf,

    /// JSON file holding a full scoring policy.
    #[arg(long)]
    policy: Option<PathBuf>,

    /// JSON file holding store settings; omitted fields keep defaults.
    #[arg(long)]
    store_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Metric {
        #[command(subcommand)]
        command: Box<MetricCommand>,
    },
    History(HistoryArgs),
    Test {
        #[command(subcommand)]
        command: Box<TestCommand>,
    },
    Usage {
        #[command(subcommand)]
        command: Box<UsageCommand>,
    },
    Score {
        #[command(subcommand)]
        command: Box<ScoreCommand>,
    },
    Policy {
        #[command(subcommand)]
        command: Box<PolicyCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum MetricCommand {
    Create(CreateArgs),
    Show(IdArgs),
    List(ListArgs),
    Search(SearchArgs),
    Update(UpdateArgs),
    Delete(IdArgs),
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    calculation: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    data_source: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "dependency")]
    dependencies: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, conflicts_with = "tag")]
    owner: Option<String>,
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(long)]
    query: String,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    actor: Option<String>,
    /// JSON object of field -> new value.
    #[arg(long)]
    changes: String,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum TestCommand {
    Record(TestRecordArgs),
    List(IdArgs),
}

#[derive(Debug, Args)]
pub struct TestRecordArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    test_type: String,
    #[arg(long)]
    expression: String,
    #[arg(long)]
    expected: String,
    #[arg(long)]
    status: TestStatusArg,
    #[arg(long)]
    ran_at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum UsageCommand {
    Record(UsageRecordArgs),
    Stats(UsageStatsArgs),
}

#[derive(Debug, Args)]
pub struct UsageRecordArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    context: Option<String>,
}

#[derive(Debug, Args)]
pub struct UsageStatsArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value_t = 30)]
    window_days: u32,
}

#[derive(Debug, Subcommand)]
pub enum ScoreCommand {
    Show(ScoreShowArgs),
    Record(IdArgs),
    History(ScoreHistoryArgs),
}

#[derive(Debug, Args)]
pub struct ScoreShowArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct ScoreHistoryArgs {
    #[arg(long)]
    id: String,
    #[arg(long, default_value_t = 90)]
    window_days: u32,
    #[arg(long)]
    sparkline: bool,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TestStatusArg {
    Pass,
    Fail,
    Unknown,
}

/// Executes the parsed top-level CLI command graph and prints its JSON result.
///
/// # Errors
/// Returns an error when configuration loading, migration, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let policy = load_policy(cli.policy.as_deref())?;
    let store_config = load_store_config(cli.store_config.as_deref())?;

    let output = match cli.command {
        Command::Policy { command } => run_policy(&command, &policy)?,
        command => {
            let mut store = open_store(&cli.db, store_config)?;
            execute(command, &mut store, &policy)?
        }
    };

    print_json(&output)
}

/// Executes one command against the `SQLite` DB at `db_path` with default
/// policy and store settings.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let policy = ScoringPolicy::v1();
    let output = match command {
        Command::Policy { command } => run_policy(&command, &policy)?,
        command => {
            let mut store = open_store(db_path, StoreConfig::default())?;
            execute(command, &mut store, &policy)?
        }
    };
    print_json(&output)
}

/// Executes a command against an existing store and returns its JSON output.
///
/// # Errors
/// Returns an error when validation, persistence, or scoring fails.
pub fn execute(
    command: Command,
    store: &mut SqliteMetricStore,
    policy: &ScoringPolicy,
) -> Result<Value> {
    match command {
        Command::Metric { command } => run_metric(*command, store),
        Command::History(args) => Ok(serde_json::to_value(store.history(&args.id, args.limit)?)?),
        Command::Test { command } => run_test(*command, store),
        Command::Usage { command } => run_usage(*command, store),
        Command::Score { command } => run_score(*command, store, policy),
        Command::Policy { command } => run_policy(&command, policy),
    }
}

fn run_metric(command: MetricCommand, store: &mut SqliteMetricStore) -> Result<Value> {
    let value = match command {
        MetricCommand::Create(args) => {
            let metric = store.create(NewMetric {
                id: args.id,
                name: args.name,
                description: args.description,
                calculation: args.calculation,
                owner: args.owner,
                data_source: args.data_source,
                tags: args.tags.into_iter().collect(),
                dependencies: args.dependencies,
            })?;
            serde_json::to_value(metric)?
        }
        MetricCommand::Show(args) => serde_json::to_value(store.get(&args.id)?)?,
        MetricCommand::List(args) => {
            let metrics = match (args.owner, args.tag) {
                (Some(owner), _) => store.list_by_owner(&owner)?,
                (None, Some(tag)) => store.list_by_tag(&tag)?,
                (None, None) => store.list_all().collect::<metric_trust_core::Result<Vec<_>>>()?,
            };
            serde_json::to_value(metrics)?
        }
        MetricCommand::Search(args) => serde_json::to_value(store.search(&args.query)?)?,
        MetricCommand::Update(args) => {
            let changes = MetricChanges::from_json(&parse_changes_json(&args.changes)?)?;
            let report = store.update(&args.id, &changes, args.actor.as_deref())?;
            serde_json::to_value(report)?
        }
        MetricCommand::Delete(args) => {
            let report = store.delete(&args.id)?;
            json!({ "deleted": args.id, "cascaded": report })
        }
    };
    Ok(value)
}

fn run_test(command: TestCommand, store: &mut SqliteMetricStore) -> Result<Value> {
    let value = match command {
        TestCommand::Record(args) => {
            let input = ValidationTestInput {
                test_type: args.test_type,
                expression: args.expression,
                expected_result: args.expected,
                status: map_status(args.status),
                last_run: args.ran_at.as_deref().map(parse_utc).transpose()?,
            };
            serde_json::to_value(store.record_test(&args.id, &input)?)?
        }
        TestCommand::List(args) => serde_json::to_value(store.validation_tests(&args.id)?)?,
    };
    Ok(value)
}

fn run_usage(command: UsageCommand, store: &mut SqliteMetricStore) -> Result<Value> {
    let value = match command {
        UsageCommand::Record(args) => serde_json::to_value(store.record_usage(
            &args.id,
            &args.actor,
            args.context.as_deref(),
        )?)?,
        UsageCommand::Stats(args) => {
            serde_json::to_value(store.usage_stats(&args.id, args.window_days)?)?
        }
    };
    Ok(value)
}

fn run_score(
    command: ScoreCommand,
    store: &mut SqliteMetricStore,
    policy: &ScoringPolicy,
) -> Result<Value> {
    let value = match command {
        ScoreCommand::Show(args) => {
            let as_of = match args.as_of.as_deref() {
                Some(raw) => parse_utc(raw)?,
                None => now_utc(),
            };
            let recorder = ScoreRecorder::new(store, policy.clone())?;
            let assessment = recorder.evaluate_at(&args.id, as_of)?;
            let mut value = serde_json::to_value(&assessment)?;
            value["grade_label"] = json!(assessment.grade.label());
            value["trend_arrow"] = json!(assessment.trend.arrow());
            value
        }
        ScoreCommand::Record(args) => {
            let mut recorder = ScoreRecorder::new(store, policy.clone())?;
            serde_json::to_value(recorder.evaluate_and_record(&args.id)?)?
        }
        ScoreCommand::History(args) => {
            let snapshots = store.score_history(&args.id, args.window_days)?;
            if args.sparkline {
                let oldest_first: Vec<f64> = snapshots.iter().rev().map(|s| s.score).collect();
                json!({
                    "metric_id": args.id,
                    "window_days": args.window_days,
                    "sparkline": sparkline(&oldest_first),
                    "snapshots": snapshots,
                })
            } else {
                serde_json::to_value(snapshots)?
            }
        }
    };
    Ok(value)
}

fn run_policy(command: &PolicyCommand, policy: &ScoringPolicy) -> Result<Value> {
    match command {
        PolicyCommand::Show => Ok(serde_json::to_value(policy)?),
    }
}

fn open_store(db_path: &Path, config: StoreConfig) -> Result<SqliteMetricStore> {
    let mut store = SqliteMetricStore::open_with_config(db_path, config)
        .with_context(|| format!("failed to open metric store at {}", db_path.display()))?;
    store.migrate().context("failed to migrate metric store")?;
    tracing::debug!(db = %db_path.display(), "metric store ready");
    Ok(store)
}

fn load_policy(path: Option<&Path>) -> Result<ScoringPolicy> {
    match path {
        Some(path) => Ok(ScoringPolicy::from_json(&read_json_file(path)?)?),
        None => Ok(ScoringPolicy::v1()),
    }
}

fn load_store_config(path: Option<&Path>) -> Result<StoreConfig> {
    match path {
        Some(path) => Ok(StoreConfig::from_json(&read_json_file(path)?)?),
        None => Ok(StoreConfig::default()),
    }
}

fn read_json_file(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} must contain valid JSON", path.display()))
}

fn parse_changes_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("changes must be valid JSON: {raw}"))
}

fn parse_utc(raw: &str) -> Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp: {err}"))
}

fn map_status(value: TestStatusArg) -> TestStatus {
    match value {
        TestStatusArg::Pass => TestStatus::Pass,
        TestStatusArg::Fail => TestStatus::Fail,
        TestStatusArg::Unknown => TestStatus::Unknown,
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
