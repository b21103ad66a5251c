use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use memory_index_api::{
    ListFilter, MemoryIndexApi, NewRecord, RecordPatch, SearchRequest, StorageRoots,
    API_CONTRACT_VERSION,
};
use memory_index_core::{search_tie_breakers, RecordId, RecordKind, Scope};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "MEMORY_INDEX_LOG";
const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "mi")]
#[command(about = "Append-log memory index CLI")]
struct Cli {
    /// Shared storage root.
    #[arg(long, default_value = "./.memory-index")]
    root: PathBuf,

    /// Optional root for `local`-scoped records.
    #[arg(long)]
    local_root: Option<PathBuf>,

    /// Writer label recorded in log file names; defaults to `cli-<pid>`.
    #[arg(long)]
    writer: Option<String>,

    /// Tracing filter, e.g. `info` or `memory_index_store_fs=debug`. Falls back to
    /// `MEMORY_INDEX_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Init,
    Add {
        #[command(subcommand)]
        command: Box<AddCommand>,
    },
    Update(UpdateArgs),
    Delete(IdArgs),
    Access(AccessArgs),
    Show(IdArgs),
    List(ListArgs),
    Search(SearchArgs),
    Rebuild(RebuildArgs),
    Status,
    Stats,
}

#[derive(Debug, Subcommand)]
enum AddCommand {
    Note(AddArgs),
    Decision(AddArgs),
    Implementation(AddArgs),
    Pattern(AddArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    summary: String,
    #[arg(long, value_enum, default_value_t = ScopeArg::Shared)]
    scope: ScopeArg,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "keyword")]
    keywords: Vec<String>,
    #[arg(long = "trigger")]
    triggers: Vec<String>,
    #[arg(long = "related")]
    related: Vec<String>,
    #[arg(long = "file")]
    files: Vec<String>,
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "keyword")]
    keywords: Vec<String>,
    #[arg(long = "trigger")]
    triggers: Vec<String>,
    #[arg(long = "related")]
    related: Vec<String>,
    #[arg(long = "file")]
    files: Vec<String>,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct AccessArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    query: Option<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    #[arg(long, value_enum)]
    scope: Option<ScopeArg>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long, default_value = "")]
    text: String,
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    #[arg(long, value_enum)]
    scope: Option<ScopeArg>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct RebuildArgs {
    #[arg(long, value_enum)]
    scope: Option<ScopeArg>,
    #[arg(long, default_value_t = false)]
    if_needed: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Note,
    Decision,
    Implementation,
    Pattern,
}

impl From<KindArg> for RecordKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Note => Self::Note,
            KindArg::Decision => Self::Decision,
            KindArg::Implementation => Self::Implementation,
            KindArg::Pattern => Self::Pattern,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Shared,
    Local,
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Shared => Self::Shared,
            ScopeArg::Local => Self::Local,
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

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
    };
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to initialise logging: {err}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let writer = cli.writer.unwrap_or_else(|| format!("cli-{}", std::process::id()));
    tracing::debug!(
        root = %cli.root.display(),
        writer = %writer,
        api = API_CONTRACT_VERSION,
        "starting"
    );
    let api = MemoryIndexApi::new(StorageRoots::new(cli.root, cli.local_root), writer);

    match cli.command {
        Command::Init => emit_json(serde_json::to_value(api.init()?)?),
        Command::Add { command } => run_add(&api, *command),
        Command::Update(args) => run_update(&api, args),
        Command::Delete(args) => {
            let id = parse_record_id(&args.id)?;
            let deleted = api.delete_record(&id)?;
            emit_json(serde_json::json!({ "id": id, "deleted": deleted }))
        }
        Command::Access(args) => {
            let id = parse_record_id(&args.id)?;
            let access = api
                .record_access(&id, args.query.as_deref())?
                .ok_or_else(|| anyhow!("record {id} not found"))?;
            emit_json(serde_json::json!({ "id": id, "access": access }))
        }
        Command::Show(args) => {
            let id = parse_record_id(&args.id)?;
            let record = api.show(&id)?.ok_or_else(|| anyhow!("record {id} not found"))?;
            emit_json(serde_json::to_value(record)?)
        }
        Command::List(args) => {
            let filter = ListFilter {
                kind: args.kind.map(Into::into),
                scope: args.scope.map(Into::into),
                tags: args.tags,
                limit: args.limit,
            };
            let records = api.list(&filter)?;
            emit_json(serde_json::json!({ "count": records.len(), "records": records }))
        }
        Command::Search(args) => run_search(&api, args),
        Command::Rebuild(args) => {
            let reports = if args.if_needed {
                api.rebuild_if_needed()?
            } else {
                api.rebuild(args.scope.map(Into::into))?
            };
            emit_json(serde_json::json!({ "rebuilds": reports }))
        }
        Command::Status => emit_json(serde_json::to_value(api.status()?)?),
        Command::Stats => emit_json(serde_json::to_value(api.stats()?)?),
    }
}

fn run_add(api: &MemoryIndexApi, command: AddCommand) -> Result<()> {
    let (kind, args) = match command {
        AddCommand::Note(args) => (RecordKind::Note, args),
        AddCommand::Decision(args) => (RecordKind::Decision, args),
        AddCommand::Implementation(args) => (RecordKind::Implementation, args),
        AddCommand::Pattern(args) => (RecordKind::Pattern, args),
    };

    let mut input = NewRecord::new(kind, args.scope.into(), args.title);
    input.summary = args.summary;
    input.tags = args.tags;
    input.keywords = args.keywords;
    input.triggers = args.triggers;
    input.related = parse_record_ids(&args.related)?;
    input.files = args.files;
    input.id = args.id.as_deref().map(parse_record_id).transpose()?;

    emit_json(serde_json::to_value(api.add_record(input)?)?)
}

fn run_update(api: &MemoryIndexApi, args: UpdateArgs) -> Result<()> {
    let id = parse_record_id(&args.id)?;
    let patch = RecordPatch {
        title: args.title,
        summary: args.summary,
        tags: non_empty(args.tags),
        keywords: non_empty(args.keywords),
        triggers: non_empty(args.triggers),
        related: non_empty(args.related).map(|related| parse_record_ids(&related)).transpose()?,
        files: non_empty(args.files),
    };
    emit_json(serde_json::to_value(api.update_record(&id, patch)?)?)
}

fn run_search(api: &MemoryIndexApi, args: SearchArgs) -> Result<()> {
    let request = SearchRequest {
        text: args.text,
        tags: args.tags,
        kind: args.kind.map(Into::into),
        scope: args.scope.map(Into::into),
        limit: args.limit,
        as_of: args.as_of.as_deref().map(parse_rfc3339).transpose()?,
    };
    let query = request.text.clone();
    let hits = api.search(request)?;
    emit_json(serde_json::json!({
        "query": query,
        "ordering": search_tie_breakers(),
        "count": hits.len(),
        "hits": hits
    }))
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn parse_record_id(value: &str) -> Result<RecordId> {
    RecordId::parse(value).with_context(|| format!("invalid record id: {value}"))
}

fn parse_record_ids(values: &[String]) -> Result<Vec<RecordId>> {
    values.iter().map(|value| parse_record_id(value)).collect()
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
