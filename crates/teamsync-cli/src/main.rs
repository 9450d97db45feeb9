use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use teamsync_core::{FixedOffsetClock, FullConfig, RecordKind, RecordPayload};
use teamsync_engine::{FilePollSource, Roster, SyncEngine};
use teamsync_store::{
    ConfigReader, JsonFileBackend, RecordStore, TableBackend, CONFIG_END_MARKER, CONFIG_SHEET,
    RECORD_HEADER, RECORD_SHEET,
};
use time::UtcOffset;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DATA_DIR_ENV: &str = "TEAMSYNC_DATA_DIR";
const BACKEND_FILE_ENV: &str = "TEAMSYNC_BACKEND_FILE";
const DEFAULT_DATA_DIR: &str = "./teamsync-data";
const ROSTER_FILE: &str = "roster.json";

#[derive(Debug, Parser)]
#[command(name = "teamsync")]
#[command(about = "Idempotent record store and poll-synchronization engine")]
struct Cli {
    /// Working directory for snapshots, history, and poll answer drops.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Backing table file; defaults to `backend.json` inside the data dir.
    #[arg(long)]
    backend_file: Option<PathBuf>,

    /// Fixed UTC offset, in hours, used for record timestamps.
    #[arg(long, default_value_t = 3)]
    utc_offset_hours: i8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    /// Run one reconciliation pass against the active poll.
    Run,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(RecordAddArgs),
    Check(RecordCheckArgs),
    Status(RecordStatusArgs),
    List(RecordListArgs),
    Cleanup(RecordCleanupArgs),
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[arg(long)]
    kind: KindArg,
    #[arg(long)]
    id: String,
    #[arg(long, default_value = "active")]
    status: String,
    #[arg(long = "qualifier")]
    qualifiers: Vec<String>,
    #[arg(long)]
    text: Option<String>,
    #[arg(long)]
    link: Option<String>,
    #[arg(long)]
    game_id: Option<i64>,
    #[arg(long)]
    season_id: Option<i64>,
    #[arg(long)]
    team_id: Option<i64>,
    #[arg(long)]
    opponent_id: Option<i64>,
    #[arg(long)]
    game_date: Option<String>,
    #[arg(long)]
    game_time: Option<String>,
    #[arg(long)]
    arena: Option<String>,
    #[arg(long)]
    poll_id: Option<String>,
    #[arg(long)]
    topic_id: Option<i64>,
}

#[derive(Debug, Args)]
struct RecordCheckArgs {
    #[arg(long)]
    kind: KindArg,
    #[arg(long)]
    id: String,
    #[arg(long = "qualifier")]
    qualifiers: Vec<String>,
}

#[derive(Debug, Args)]
struct RecordStatusArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    status: String,
}

#[derive(Debug, Args)]
struct RecordListArgs {
    #[arg(long)]
    kind: KindArg,
    #[arg(long, default_value_t = false)]
    active_only: bool,
}

#[derive(Debug, Args)]
struct RecordCleanupArgs {
    /// Limit cleanup to one record kind; omitted means every kind.
    #[arg(long)]
    kind: Option<KindArg>,
    #[arg(long, default_value_t = 30)]
    max_age_days: i64,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Parse and print the full configuration region.
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    GameResult,
    Birthday,
    VotingPoll,
    TrainingPoll,
    Team,
    Competition,
    Fallback,
}

impl From<KindArg> for RecordKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::GameResult => Self::GameResult,
            KindArg::Birthday => Self::Birthday,
            KindArg::VotingPoll => Self::VotingPoll,
            KindArg::TrainingPoll => Self::TrainingPoll,
            KindArg::Team => Self::Team,
            KindArg::Competition => Self::Competition,
            KindArg::Fallback => Self::Fallback,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("teamsync=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn resolve_data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| {
        std::env::var(DATA_DIR_ENV).map_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from)
    })
}

fn resolve_backend_file(cli: &Cli, data_dir: &Path) -> PathBuf {
    cli.backend_file.clone().unwrap_or_else(|| {
        std::env::var(BACKEND_FILE_ENV)
            .map_or_else(|_| data_dir.join("backend.json"), PathBuf::from)
    })
}

fn clock_for(cli: &Cli) -> Result<FixedOffsetClock> {
    let offset = UtcOffset::from_hms(cli.utc_offset_hours, 0, 0)
        .context("utc offset must be within -23..=23 hours")?;
    Ok(FixedOffsetClock::new(offset))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(&cli);
    let backend_file = resolve_backend_file(&cli, &data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let clock = clock_for(&cli)?;
    let backend = JsonFileBackend::open(&backend_file)?;
    backend.ensure_sheet(RECORD_SHEET, &RECORD_HEADER)?;
    // A fresh backend gets an empty marker skeleton for humans to fill in.
    backend.ensure_sheet(CONFIG_SHEET, &[CONFIG_END_MARKER])?;

    match cli.command {
        Command::Sync { command: SyncCommand::Run } => {
            run_sync(backend, clock, &data_dir)
        }
        Command::Record { command } => run_record(*command, &backend, clock),
        Command::Config { command: ConfigCommand::Show } => {
            let config = ConfigReader::new(&backend).get_full_config()?;
            emit_json(serde_json::to_value(&config).context("failed to serialize config")?)
        }
    }
}

fn run_sync(backend: JsonFileBackend, clock: FixedOffsetClock, data_dir: &Path) -> Result<()> {
    let config = ConfigReader::new(&backend).get_full_config()?;
    if config == FullConfig::default() {
        bail!("configuration region is empty; seed the config sheet before running sync");
    }

    let roster = Roster::load(&data_dir.join(ROSTER_FILE))?;
    let source = FilePollSource::new(data_dir);
    let engine = SyncEngine::new(backend, source, clock, data_dir, roster)?;
    let outcome = engine.run_pass()?;
    emit_json(serde_json::to_value(&outcome).context("failed to serialize pass outcome")?)
}

fn run_record(
    command: RecordCommand,
    backend: &JsonFileBackend,
    clock: FixedOffsetClock,
) -> Result<()> {
    let store = RecordStore::open(backend, clock)?;
    match command {
        RecordCommand::Add(args) => {
            let payload = RecordPayload {
                text: args.text,
                link: args.link,
                game_id: args.game_id,
                season_id: args.season_id,
                team_id: args.team_id,
                opponent_id: args.opponent_id,
                game_date: args.game_date,
                game_time: args.game_time,
                arena: args.arena,
                poll_id: args.poll_id,
                topic_id: args.topic_id,
                extra: None,
            };
            let qualifiers: Vec<&str> = args.qualifiers.iter().map(String::as_str).collect();
            let outcome = store.add_record(
                args.kind.into(),
                &args.id,
                &args.status,
                &payload,
                &qualifiers,
            )?;
            emit_json(serde_json::json!({
                "inserted": outcome.inserted,
                "unique_key": outcome.unique_key
            }))
        }
        RecordCommand::Check(args) => {
            let qualifiers: Vec<&str> = args.qualifiers.iter().map(String::as_str).collect();
            let check = store.check_duplicate(args.kind.into(), &args.id, &qualifiers)?;
            emit_json(serde_json::json!({
                "exists": check.exists,
                "unique_key": check.unique_key,
                "row_index": check.row_index
            }))
        }
        RecordCommand::Status(args) => {
            let updated = store.update_record_status(&args.key, &args.status)?;
            emit_json(serde_json::json!({
                "record_key": args.key,
                "status": args.status,
                "updated": updated
            }))
        }
        RecordCommand::List(args) => {
            let kind: RecordKind = args.kind.into();
            let records = if args.active_only {
                store.get_active_records(kind)?
            } else {
                store.get_records_by_kind(kind)?
            };
            emit_json(serde_json::json!({
                "kind": kind.as_str(),
                "count": records.len(),
                "records": records
            }))
        }
        RecordCommand::Cleanup(args) => {
            let deleted = match args.kind {
                Some(kind) => store.cleanup_old_records(kind.into(), args.max_age_days)?,
                None => store.cleanup_expired_records(args.max_age_days)?,
            };
            emit_json(serde_json::json!({
                "max_age_days": args.max_age_days,
                "deleted": deleted
            }))
        }
    }
}
