//! Embedded command surface for review prompting over a `SQLite` database.
//!
//! Hosts should go through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_tracker_with_db`] for a single [`TrackerCommand`] against a DB path.
//! - [`run_tracker`] / [`execute_tracker`] against an already opened
//!   [`SqliteKeyValueStore`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use review_prompter_core::{
    format_rfc3339, identifier_from_condition_key, now_utc, parse_rfc3339_utc, CooldownStatus,
    EventCounterStore, EventRecord, FixedClock, GateConfig, KeyValueStore, PromptGate,
    PromptOutcome, CONDITION_KEY_PREFIX,
};
use review_prompter_store_sqlite::SqliteKeyValueStore;
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rp")]
#[command(about = "Review prompter event tracking CLI")]
pub struct Cli {
    #[arg(long, default_value = "./review_prompter.sqlite3")]
    db: PathBuf,

    /// JSON gate configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `minimum_interval_seconds` from the configuration.
    #[arg(long)]
    min_interval_secs: Option<i64>,

    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: TrackerCommand,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum TrackerCommand {
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Prompt {
        #[command(subcommand)]
        command: Box<PromptCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Register(RegisterArgs),
    Increment(IdentifierArgs),
    Reset(IdentifierArgs),
    Stop(IdentifierArgs),
    Show(IdentifierArgs),
    List,
    /// Increments the event and requests a review prompt once its condition is met.
    Hit(HitArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    condition: u32,
}

#[derive(Debug, Args)]
pub struct IdentifierArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct HitArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PromptCommand {
    Request(NowArgs),
    Status(NowArgs),
    History,
    Clear,
}

#[derive(Debug, Args)]
pub struct NowArgs {
    /// RFC3339 UTC instant used instead of the system clock.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventPayload {
    pub identifier: String,
    pub tracked: bool,
    pub condition: Option<u32>,
    pub count: u64,
    pub condition_met: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HitPayload {
    pub identifier: String,
    pub outcome: PromptOutcome,
    pub triggered: bool,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CooldownPayload {
    pub permitted: bool,
    pub now: String,
    pub last_prompt_at: Option<String>,
    pub elapsed_seconds: Option<f64>,
    pub minimum_interval_seconds: f64,
}

/// Installs the stderr log subscriber. `RUST_LOG` wins over `verbose`.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store open/migration, or
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = resolve_gate_config(cli.config.as_deref(), cli.min_interval_secs)?;
    run_tracker_with_db(&cli.db, &config, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_tracker_with_db(
    db_path: &Path,
    config: &GateConfig,
    command: TrackerCommand,
) -> Result<()> {
    let mut store = SqliteKeyValueStore::open(db_path)?;
    store.migrate()?;
    run_tracker(command, &mut store, config)
}

/// Executes a parsed command against an existing store handle and prints the
/// JSON result on stdout.
///
/// # Errors
/// Returns an error when validation, persistence, or gating fails.
pub fn run_tracker(
    command: TrackerCommand,
    store: &mut SqliteKeyValueStore,
    config: &GateConfig,
) -> Result<()> {
    let payload = execute_tracker(command, store, config)?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// Executes a parsed command and returns its JSON result.
///
/// # Errors
/// Same as [`run_tracker`].
pub fn execute_tracker(
    command: TrackerCommand,
    store: &mut SqliteKeyValueStore,
    config: &GateConfig,
) -> Result<Value> {
    match command {
        TrackerCommand::Event { command } => run_event(*command, store, config),
        TrackerCommand::Prompt { command } => run_prompt(*command, store, config),
    }
}

fn run_event(
    command: EventCommand,
    store: &mut SqliteKeyValueStore,
    config: &GateConfig,
) -> Result<Value> {
    match command {
        EventCommand::List => {
            let identifiers = store
                .keys_with_prefix(CONDITION_KEY_PREFIX)?
                .iter()
                .filter_map(|key| identifier_from_condition_key(key).map(str::to_string))
                .collect::<Vec<_>>();

            let counters = EventCounterStore::new(&mut *store);
            let mut events = Vec::with_capacity(identifiers.len());
            for identifier in &identifiers {
                events.push(event_payload(&counters, identifier)?);
            }
            Ok(json!({ "events": events }))
        }
        EventCommand::Hit(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            let mut gate = open_gate(store, config, now)?;
            let outcome = gate.increment_and_maybe_trigger(&args.id)?;
            let payload = HitPayload {
                count: gate.counters().count(&args.id),
                identifier: args.id,
                outcome,
                triggered: outcome.triggered(),
            };
            Ok(serde_json::to_value(payload)?)
        }
        EventCommand::Register(args) => {
            let mut counters = EventCounterStore::new(&mut *store);
            counters.register(&args.id, args.condition)?;
            Ok(serde_json::to_value(event_payload(&counters, &args.id)?)?)
        }
        EventCommand::Increment(args) => {
            let mut counters = EventCounterStore::new(&mut *store);
            counters.increment(&args.id)?;
            Ok(serde_json::to_value(event_payload(&counters, &args.id)?)?)
        }
        EventCommand::Reset(args) => {
            let mut counters = EventCounterStore::new(&mut *store);
            counters.reset(&args.id)?;
            Ok(serde_json::to_value(event_payload(&counters, &args.id)?)?)
        }
        EventCommand::Stop(args) => {
            let mut counters = EventCounterStore::new(&mut *store);
            counters.stop_tracking(&args.id)?;
            Ok(serde_json::to_value(event_payload(&counters, &args.id)?)?)
        }
        EventCommand::Show(args) => {
            let counters = EventCounterStore::new(&mut *store);
            Ok(serde_json::to_value(event_payload(&counters, &args.id)?)?)
        }
    }
}

fn run_prompt(
    command: PromptCommand,
    store: &mut SqliteKeyValueStore,
    config: &GateConfig,
) -> Result<Value> {
    match command {
        PromptCommand::Request(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            let mut gate = open_gate(store, config, now)?;
            let requested = gate.request_trigger();
            Ok(json!({
                "requested": requested,
                "requested_at": if requested { Some(format_utc(now)?) } else { None },
            }))
        }
        PromptCommand::Status(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            let gate = open_gate(store, config, now)?;
            let status = gate.cooldown_status()?;
            Ok(serde_json::to_value(cooldown_payload(&status)?)?)
        }
        PromptCommand::History => {
            let gate = open_gate(store, config, now_utc())?;
            let dates = gate
                .history()?
                .into_iter()
                .map(format_utc)
                .collect::<Result<Vec<_>>>()?;
            Ok(json!({ "prompt_dates": dates }))
        }
        PromptCommand::Clear => {
            let mut gate = open_gate(store, config, now_utc())?;
            gate.clear_history();
            Ok(json!({ "prompt_dates": Vec::<String>::new() }))
        }
    }
}

type CliGate<'a> = PromptGate<&'a mut SqliteKeyValueStore, FixedClock, fn()>;

fn open_gate<'a>(
    store: &'a mut SqliteKeyValueStore,
    config: &GateConfig,
    now: OffsetDateTime,
) -> Result<CliGate<'a>> {
    let action: fn() = announce_review_prompt;
    let gate = PromptGate::from_config(
        EventCounterStore::new(store),
        config,
        FixedClock(now),
        action,
    )?;
    Ok(gate)
}

fn announce_review_prompt() {
    info!(target: "review_prompter", "review prompt requested");
}

fn event_payload<S: KeyValueStore>(
    counters: &EventCounterStore<S>,
    identifier: &str,
) -> Result<EventPayload> {
    let payload = match counters.record(identifier)? {
        Some(record) => EventPayload::from(record),
        None => untracked_payload(identifier),
    };
    Ok(payload)
}

fn untracked_payload(identifier: &str) -> EventPayload {
    EventPayload {
        identifier: identifier.to_string(),
        tracked: false,
        condition: None,
        count: 0,
        condition_met: false,
    }
}

impl From<EventRecord> for EventPayload {
    fn from(record: EventRecord) -> Self {
        Self {
            condition_met: record.has_met_condition(),
            tracked: true,
            condition: Some(record.condition),
            count: record.count,
            identifier: record.identifier,
        }
    }
}

fn cooldown_payload(status: &CooldownStatus) -> Result<CooldownPayload> {
    Ok(CooldownPayload {
        permitted: status.permitted,
        now: format_utc(status.now)?,
        last_prompt_at: status.last_prompt_at.map(format_utc).transpose()?,
        elapsed_seconds: status.elapsed.map(|elapsed| elapsed.as_seconds_f64()),
        minimum_interval_seconds: status.minimum_interval.as_seconds_f64(),
    })
}

/// Loads the gate configuration file (if any) and applies CLI overrides.
///
/// # Errors
/// Returns an error when the file cannot be read or decoded, or the final
/// configuration is invalid.
pub fn resolve_gate_config(
    config_path: Option<&Path>,
    min_interval_override: Option<i64>,
) -> Result<GateConfig> {
    let mut config = match config_path {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read gate config {}", path.display()))?;
            let value: Value = serde_json::from_str(&body)
                .with_context(|| format!("gate config {} is not valid JSON", path.display()))?;
            GateConfig::from_json(&value)?
        }
        None => GateConfig::default(),
    };

    if let Some(seconds) = min_interval_override {
        config.minimum_interval_seconds = seconds;
    }
    config.validate()?;
    Ok(config)
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => Ok(parse_rfc3339_utc(value)?),
        None => Ok(now_utc()),
    }
}

fn format_utc(value: OffsetDateTime) -> Result<String> {
    Ok(format_rfc3339(value)?)
}
