use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use briefing_kernel_api::{
    BriefingConfig, BriefingKernelApi, CreateHandoffRequest, DisabledSummarizer, HttpSummarizer,
    LogInteractionRequest, ResolveRequest, Summarizer,
};
use briefing_kernel_core::{
    ContactId, ContactUpdate, ErrorClass, ErrorId, HandoffId, HandoffStatus, InteractionDirection,
    NewContact, NewErrorRecord, Urgency,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "bk")]
#[command(about = "Contact briefing kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./briefing_kernel.sqlite3")]
    db: PathBuf,

    /// Optional YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Knowledge document path; overrides the configuration file.
    #[arg(long)]
    knowledge: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Contact {
        #[command(subcommand)]
        command: Box<ContactCommand>,
    },
    Interaction {
        #[command(subcommand)]
        command: Box<InteractionCommand>,
    },
    Context {
        #[command(subcommand)]
        command: ContextCommand,
    },
    Handoff {
        #[command(subcommand)]
        command: Box<HandoffCommand>,
    },
    Errors {
        #[command(subcommand)]
        command: Box<ErrorsCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Anneal {
        #[command(subcommand)]
        command: AnnealCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    Add(ContactAddArgs),
    Show(ContactIdArgs),
    Update(ContactUpdateArgs),
}

#[derive(Debug, Args)]
struct ContactAddArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    role: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct ContactIdArgs {
    #[arg(long)]
    contact_id: String,
}

#[derive(Debug, Args)]
struct ContactUpdateArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    role: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Subcommand)]
enum InteractionCommand {
    Log(InteractionLogArgs),
}

#[derive(Debug, Args)]
struct InteractionLogArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long)]
    channel: String,
    #[arg(long, value_enum)]
    direction: DirectionArg,
    #[arg(long)]
    raw_content: Option<String>,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long = "key-point")]
    key_points: Vec<String>,
    #[arg(long)]
    sentiment: Option<String>,
    #[arg(long)]
    intent: Option<String>,
    /// RFC 3339 timestamp; defaults to now.
    #[arg(long)]
    occurred_at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContextCommand {
    Show(ContextShowArgs),
    Refresh(ContactIdArgs),
    NightlyRefresh,
}

#[derive(Debug, Args)]
struct ContextShowArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long, default_value_t = 1)]
    level: u8,
    #[arg(long, default_value_t = false)]
    refresh: bool,
}

#[derive(Debug, Subcommand)]
enum HandoffCommand {
    Create(HandoffCreateArgs),
    Status(HandoffStatusArgs),
}

#[derive(Debug, Args)]
struct HandoffCreateArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long)]
    from_agent: String,
    #[arg(long)]
    to_agent: String,
    #[arg(long)]
    reason: String,
    #[arg(long, value_enum, default_value_t = UrgencyArg::Normal)]
    urgency: UrgencyArg,
}

#[derive(Debug, Args)]
struct HandoffStatusArgs {
    #[arg(long)]
    handoff_id: String,
    #[arg(long, value_enum)]
    status: HandoffStatusArg,
}

#[derive(Debug, Subcommand)]
enum ErrorsCommand {
    Log(ErrorsLogArgs),
    Summary(WindowArgs),
    Patterns(WindowArgs),
    Resolve(ErrorsResolveArgs),
}

#[derive(Debug, Args)]
struct ErrorsLogArgs {
    #[arg(long = "type", value_enum)]
    error_type: ErrorClassArg,
    #[arg(long)]
    service: String,
    #[arg(long)]
    operation: String,
    #[arg(long)]
    message: String,
    /// JSON object stored alongside the record.
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    pattern_id: Option<String>,
}

#[derive(Debug, Args)]
struct WindowArgs {
    #[arg(long, default_value_t = 24)]
    window_hours: u32,
}

#[derive(Debug, Args)]
struct ErrorsResolveArgs {
    #[arg(long, conflicts_with = "ids")]
    pattern_id: Option<String>,
    #[arg(long = "id")]
    ids: Vec<String>,
    #[arg(long)]
    resolution: String,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    Run,
}

#[derive(Debug, Subcommand)]
enum AnnealCommand {
    Run,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    Inbound,
    Outbound,
    Internal,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum UrgencyArg {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HandoffStatusArg {
    Pending,
    Accepted,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ErrorClassArg {
    Operational,
    ExternalDependency,
    BudgetExceeded,
    QualityIssue,
    IntegrationGap,
}

impl From<DirectionArg> for InteractionDirection {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Inbound => Self::Inbound,
            DirectionArg::Outbound => Self::Outbound,
            DirectionArg::Internal => Self::Internal,
        }
    }
}

impl From<UrgencyArg> for Urgency {
    fn from(value: UrgencyArg) -> Self {
        match value {
            UrgencyArg::Low => Self::Low,
            UrgencyArg::Normal => Self::Normal,
            UrgencyArg::High => Self::High,
            UrgencyArg::Critical => Self::Critical,
        }
    }
}

impl From<HandoffStatusArg> for HandoffStatus {
    fn from(value: HandoffStatusArg) -> Self {
        match value {
            HandoffStatusArg::Pending => Self::Pending,
            HandoffStatusArg::Accepted => Self::Accepted,
            HandoffStatusArg::Completed => Self::Completed,
            HandoffStatusArg::Cancelled => Self::Cancelled,
        }
    }
}

impl From<ErrorClassArg> for ErrorClass {
    fn from(value: ErrorClassArg) -> Self {
        match value {
            ErrorClassArg::Operational => Self::Operational,
            ErrorClassArg::ExternalDependency => Self::ExternalDependency,
            ErrorClassArg::BudgetExceeded => Self::BudgetExceeded,
            ErrorClassArg::QualityIssue => Self::QualityIssue,
            ErrorClassArg::IntegrationGap => Self::IntegrationGap,
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

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn parse_contact_id(raw: &str) -> Result<ContactId> {
    Ok(ContactId::parse(raw)?)
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("invalid RFC 3339 timestamp `{raw}`"))
}

/// Logs go to stderr so stdout stays a single JSON document.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn build_api(cli: &Cli) -> Result<BriefingKernelApi> {
    let mut config = BriefingConfig::load(cli.config.as_deref())?;
    if let Some(knowledge) = cli.knowledge.clone() {
        config.knowledge.path = knowledge;
    }
    let summarizer: Arc<dyn Summarizer> =
        match HttpSummarizer::from_env(config.summarizer.clone())? {
            Some(summarizer) => Arc::new(summarizer),
            None => Arc::new(DisabledSummarizer),
        };
    Ok(BriefingKernelApi::new(cli.db.clone(), config, summarizer))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = build_api(&cli)?;
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        command => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(run_async(command, &api))
        }
    }
}

fn run_db(command: DbCommand, api: &BriefingKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

async fn run_async(command: Command, api: &BriefingKernelApi) -> Result<()> {
    match command {
        Command::Db { command } => run_db(command, api),
        Command::Contact { command } => run_contact(*command, api).await,
        Command::Interaction { command } => run_interaction(*command, api).await,
        Command::Context { command } => run_context(command, api).await,
        Command::Handoff { command } => run_handoff(*command, api).await,
        Command::Errors { command } => run_errors(*command, api).await,
        Command::Audit { command: AuditCommand::Run } => emit(&api.run_quality_audit().await),
        Command::Anneal { command: AnnealCommand::Run } => emit(&api.run_annealing_cycle().await?),
    }
}

async fn run_contact(command: ContactCommand, api: &BriefingKernelApi) -> Result<()> {
    match command {
        ContactCommand::Add(args) => {
            let contact = api
                .upsert_contact(NewContact {
                    email: args.email,
                    name: args.name,
                    company: args.company,
                    role: args.role,
                    status: args.status,
                    notes: args.notes,
                })
                .await?;
            emit(&contact)
        }
        ContactCommand::Show(args) => {
            emit(&api.get_contact(parse_contact_id(&args.contact_id)?).await?)
        }
        ContactCommand::Update(args) => {
            let update = ContactUpdate {
                name: args.name,
                company: args.company,
                role: args.role,
                status: args.status,
                notes: args.notes,
            };
            emit(&api.update_contact(parse_contact_id(&args.contact_id)?, update).await?)
        }
    }
}

async fn run_interaction(command: InteractionCommand, api: &BriefingKernelApi) -> Result<()> {
    match command {
        InteractionCommand::Log(args) => {
            let contact_id = parse_contact_id(&args.contact_id)?;
            let occurred_at = args.occurred_at.as_deref().map(parse_timestamp).transpose()?;
            let interaction = api
                .log_interaction(
                    contact_id,
                    LogInteractionRequest {
                        channel: args.channel,
                        direction: args.direction.into(),
                        raw_content: args.raw_content,
                        summary: args.summary,
                        key_points: args.key_points,
                        sentiment: args.sentiment,
                        intent: args.intent,
                        occurred_at,
                    },
                )
                .await?;
            emit(&interaction)
        }
    }
}

async fn run_context(command: ContextCommand, api: &BriefingKernelApi) -> Result<()> {
    match command {
        ContextCommand::Show(args) => {
            let contact_id = parse_contact_id(&args.contact_id)?;
            emit(&api.get_context(contact_id, args.level, args.refresh).await?)
        }
        ContextCommand::Refresh(args) => {
            emit(&api.refresh_context(parse_contact_id(&args.contact_id)?).await?)
        }
        ContextCommand::NightlyRefresh => emit(&api.nightly_refresh().await?),
    }
}

async fn run_handoff(command: HandoffCommand, api: &BriefingKernelApi) -> Result<()> {
    match command {
        HandoffCommand::Create(args) => {
            let request = CreateHandoffRequest {
                contact_id: parse_contact_id(&args.contact_id)?,
                from_agent: args.from_agent,
                to_agent: args.to_agent,
                reason: args.reason,
                urgency: args.urgency.into(),
            };
            // The background refresh is awaited here; the process would
            // otherwise exit before it runs.
            let (handoff, refresh) = api.create_handoff_tracked(request).await?;
            if let Err(error) = refresh.await {
                tracing::warn!(%error, "handoff refresh task ended abnormally");
            }
            emit(&handoff)
        }
        HandoffCommand::Status(args) => {
            let handoff_id = HandoffId::parse(&args.handoff_id)?;
            emit(&api.update_handoff_status(handoff_id, args.status.into()).await?)
        }
    }
}

async fn run_errors(command: ErrorsCommand, api: &BriefingKernelApi) -> Result<()> {
    match command {
        ErrorsCommand::Log(args) => {
            let mut entry =
                NewErrorRecord::new(args.error_type.into(), args.service, args.operation, args.message);
            if let Some(raw) = args.context.as_deref() {
                let context: Value =
                    serde_json::from_str(raw).context("--context MUST be valid JSON")?;
                entry = entry.with_context(context);
            }
            if let Some(pattern_id) = args.pattern_id {
                entry = entry.with_pattern(pattern_id);
            }
            let error_id = api.report_error(entry).await?;
            emit_json(serde_json::json!({ "error_id": error_id }))
        }
        ErrorsCommand::Summary(args) => emit(&api.error_summary(args.window_hours).await?),
        ErrorsCommand::Patterns(args) => emit(&api.error_patterns(args.window_hours).await?),
        ErrorsCommand::Resolve(args) => {
            let ids = args
                .ids
                .iter()
                .map(|raw| ErrorId::parse(raw).map_err(|err| anyhow!(err)))
                .collect::<Result<Vec<_>>>()?;
            let result = api
                .resolve_errors(ResolveRequest {
                    pattern_id: args.pattern_id,
                    ids,
                    resolution: args.resolution,
                })
                .await?;
            emit(&result)
        }
    }
}
