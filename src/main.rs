use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier::config::AppConfig;
use courier::context::AppContext;
use courier::core::plan::{DownloadOptions, ForwardOptions, UploadOptions};
use courier::core::{
    Category, ExtFilter, Order, OutputTemplate, PlanOptions, ResumeStore, RunSummary,
    SchedulerEvent, TransferPlan, UnitOutcome, UnitSelector,
};
use courier::logging::{self, LogThrottle};
use courier::remote::{
    Connector, Credentials, ForwardMode, MessageRef, SessionInfo, SimulatedConnector,
    SimulatedService,
};
use courier::storage::{get_json, keys};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Resumable bulk media transfer for messaging accounts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (replaces the default lookup).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Drive an in-process simulated remote instead of a real connection.
    #[arg(long, global = true)]
    simulation: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON logs and JSON run summaries.
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

/// Flags merged over the configuration file and environment.
#[derive(Args, Serialize)]
struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Account namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    proxy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    ntp: Option<String>,

    /// Concurrent transfers.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short = 'l', long, global = true)]
    threads: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    chunk_size: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session.
    Login(LoginArgs),
    /// Revoke and forget the stored session.
    Logout,
    /// Download media from a chat.
    Dl(DownloadArgs),
    /// Upload local files to a chat.
    Up(UploadArgs),
    /// Forward or clone messages between chats.
    Forward(ForwardArgs),
    /// Import every namespace from the legacy store.
    Migrate,
    /// Stored accounts and transfer history.
    Status,
    /// Print the effective configuration.
    Config,
    /// List or delete account namespaces.
    #[command(subcommand)]
    Namespace(NamespaceCommand),
}

#[derive(Subcommand)]
enum NamespaceCommand {
    List,
    Delete { name: String },
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long)]
    phone: String,
    #[arg(long)]
    code: String,
    #[arg(long)]
    password: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    /// Continue partially transferred units.
    #[arg(long, conflicts_with = "restart")]
    resume: bool,
    /// Forget this category's history first.
    #[arg(long)]
    restart: bool,
    /// Newest first.
    #[arg(long)]
    desc: bool,
    /// Only these extensions.
    #[arg(short, long, value_delimiter = ',')]
    include: Vec<String>,
    /// Never these extensions.
    #[arg(short, long, value_delimiter = ',')]
    exclude: Vec<String>,
    /// Use a takeout session with relaxed rate limits.
    #[arg(long)]
    takeout: bool,
}

#[derive(Args)]
struct SourceArgs {
    /// Source chat id.
    #[arg(short, long)]
    chat: i64,
    /// Specific message ids; the whole history when omitted.
    #[arg(short, long, value_delimiter = ',')]
    message: Vec<i32>,
    /// First message id of the history range.
    #[arg(long)]
    from_id: Option<i32>,
    /// Last message id of the history range.
    #[arg(long)]
    to_id: Option<i32>,
}

impl SourceArgs {
    fn selector(&self) -> UnitSelector {
        if self.message.is_empty() {
            UnitSelector::ChatHistory {
                chat_id: self.chat,
                from_id: self.from_id,
                to_id: self.to_id,
            }
        } else {
            UnitSelector::Messages(
                self.message
                    .iter()
                    .map(|id| MessageRef::new(self.chat, *id))
                    .collect(),
            )
        }
    }
}

#[derive(Args)]
struct DownloadArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(short, long, default_value = "downloads")]
    dir: PathBuf,
    /// File name template, e.g. "{DialogID}_{MessageID}_{FileName}".
    #[arg(long)]
    template: Option<String>,
    /// Replace extensions with the canonical one for the media type.
    #[arg(long)]
    rewrite_ext: bool,
    /// Skip files that already exist with the expected size.
    #[arg(long)]
    skip_same: bool,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct UploadArgs {
    /// Files or directories.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    /// Target chat id.
    #[arg(long)]
    to: i64,
    #[arg(long)]
    photo: bool,
    /// Delete each file once uploaded.
    #[arg(long)]
    rm: bool,
    #[arg(long, default_value = "")]
    caption: String,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Direct,
    Clone,
}

#[derive(Args)]
struct ForwardArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Target chat id.
    #[arg(long)]
    to: i64,
    #[arg(long, value_enum, default_value = "direct")]
    mode: ModeArg,
    /// Replacement caption (clone mode).
    #[arg(long)]
    edit_text: Option<String>,
    #[arg(long)]
    silent: bool,
    #[arg(long)]
    dry_run: bool,
    /// Batch messages into one call per route.
    #[arg(long)]
    group: bool,
    #[command(flatten)]
    run: RunArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;
    config.log.verbose |= cli.verbose;
    config.log.json |= cli.json;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config: {e}");
        }
        bail!("{} configuration error(s)", errors.len());
    }

    logging::init(&config.log);

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }

    let ctx = AppContext::new(config)
        .await
        .context("Failed to open storage")?;

    match &cli.command {
        Commands::Login(args) => login(&ctx, &cli, args).await.context("Login failed")?,
        Commands::Logout => logout(&ctx, &cli).await.context("Logout failed")?,
        Commands::Dl(args) => {
            let plan = download_plan(&ctx, args)?;
            run_plan(&ctx, &cli, plan, args.run.takeout)
                .await
                .context("Download failed")?
        }
        Commands::Up(args) => {
            let plan = upload_plan(&ctx, args);
            run_plan(&ctx, &cli, plan, args.run.takeout)
                .await
                .context("Upload failed")?
        }
        Commands::Forward(args) => {
            let plan = forward_plan(&ctx, args);
            run_plan(&ctx, &cli, plan, args.run.takeout)
                .await
                .context("Forward failed")?
        }
        Commands::Migrate => migrate(&ctx).await.context("Migration failed")?,
        Commands::Status => status(&ctx).await.context("Failed to read status")?,
        Commands::Namespace(NamespaceCommand::List) => {
            for name in ctx.storage.namespaces().await? {
                println!("{name}");
            }
        }
        Commands::Namespace(NamespaceCommand::Delete { name }) => ctx
            .storage
            .delete_namespace(name)
            .await
            .with_context(|| format!("Failed to delete namespace '{name}'"))?,
        Commands::Config => {}
    }

    Ok(())
}

fn connector(cli: &Cli) -> Result<Arc<dyn Connector>> {
    if !cli.simulation {
        bail!("no remote transport is compiled into this build; rerun with --simulation");
    }
    let sim = Arc::new(SimulatedService::new());
    sim.seed_demo();
    Ok(Arc::new(SimulatedConnector::new(sim)))
}

async fn login(ctx: &AppContext, cli: &Cli, args: &LoginArgs) -> Result<()> {
    let sessions = ctx.sessions(connector(cli)?, None, false).await?;
    let info = sessions
        .login(&Credentials {
            phone: args.phone.clone(),
            code: args.code.clone(),
            password: args.password.clone(),
        })
        .await?;
    println!(
        "Logged in as {} ({}) in namespace '{}'",
        info.username.as_deref().unwrap_or("<no username>"),
        info.user_id,
        ctx.config.namespace
    );
    Ok(())
}

async fn logout(ctx: &AppContext, cli: &Cli) -> Result<()> {
    let sessions = ctx.sessions(connector(cli)?, None, false).await?;
    sessions.logout().await?;
    println!("Logged out of namespace '{}'", ctx.config.namespace);
    Ok(())
}

fn base_plan(
    ctx: &AppContext,
    selector: UnitSelector,
    options: PlanOptions,
    run: &RunArgs,
) -> TransferPlan {
    let mut plan = TransferPlan::new(selector, options);
    plan.filter = ExtFilter::new(&run.include, &run.exclude);
    plan.order = if run.desc {
        Order::Descending
    } else {
        Order::Ascending
    };
    plan.concurrency = ctx.config.threads;
    plan.resume = run.resume;
    plan.restart = run.restart;
    plan
}

fn download_plan(ctx: &AppContext, args: &DownloadArgs) -> Result<TransferPlan> {
    let mut opts = DownloadOptions::new(&args.dir);
    if let Some(template) = &args.template {
        opts.template = OutputTemplate::parse(template).context("Invalid --template")?;
    }
    opts.rewrite_ext = args.rewrite_ext;
    opts.skip_same = args.skip_same;
    opts.chunk_size = ctx.config.chunk_size;
    Ok(base_plan(
        ctx,
        args.source.selector(),
        PlanOptions::Download(opts),
        &args.run,
    ))
}

fn upload_plan(ctx: &AppContext, args: &UploadArgs) -> TransferPlan {
    let mut opts = UploadOptions::new(args.to);
    opts.photo = args.photo;
    opts.remove_after = args.rm;
    opts.caption = args.caption.clone();
    opts.chunk_size = ctx.config.chunk_size;
    base_plan(
        ctx,
        UnitSelector::LocalFiles(args.paths.clone()),
        PlanOptions::Upload(opts),
        &args.run,
    )
}

fn forward_plan(ctx: &AppContext, args: &ForwardArgs) -> TransferPlan {
    let mut opts = ForwardOptions::new(args.to);
    opts.mode = match args.mode {
        ModeArg::Direct => ForwardMode::Direct,
        ModeArg::Clone => ForwardMode::Clone,
    };
    opts.edit_text = args.edit_text.clone();
    opts.silent = args.silent;
    opts.dry_run = args.dry_run;
    opts.single = !args.group;
    let mut plan = base_plan(
        ctx,
        args.source.selector(),
        PlanOptions::Forward(opts),
        &args.run,
    );
    plan.group = args.group;
    plan
}

async fn run_plan(ctx: &AppContext, cli: &Cli, plan: TransferPlan, takeout: bool) -> Result<()> {
    let sessions = ctx.sessions(connector(cli)?, None, takeout).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight chunks");
            on_signal.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(rx));

    let summary = sessions
        .run(|client| {
            let scheduler = ctx.scheduler(&client).with_events(tx);
            let cancel = cancel.clone();
            async move { scheduler.run(&plan, &cancel).await }
        })
        .await?;
    // The scheduler held the only sender; the printer drains and exits.
    let _ = printer.await;

    print_summary(&summary, cli.json)?;
    if summary.failed > 0 {
        return Err(anyhow!("{} of {} units failed", summary.failed, summary.total()));
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::Receiver<SchedulerEvent>) {
    let progress_log = LogThrottle::new(Duration::from_secs(1));
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::Started { unit_name, total_bytes, .. } => {
                info!(unit = %unit_name, total_bytes, "Started");
            }
            SchedulerEvent::Progress(p) => {
                if progress_log.should_log() && p.total_bytes > 0 {
                    let pct = p.bytes_transferred as f64 * 100.0 / p.total_bytes as f64;
                    println!(
                        "  {} {:>5.1}% {:.1} KiB/s",
                        p.unit_name,
                        pct,
                        p.speed_bps / 1024.0
                    );
                }
            }
            SchedulerEvent::Finished { unit_name, outcome, .. } => match outcome {
                UnitOutcome::Done { bytes } => println!("done    {unit_name} ({bytes} bytes)"),
                UnitOutcome::Skipped { reason } => {
                    println!("skipped {unit_name} ({})", reason.as_str())
                }
                UnitOutcome::Failed { kind, reason } => {
                    println!("failed  {unit_name} [{kind}] {reason}")
                }
            },
        }
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }
    println!(
        "{}: {} done, {} skipped, {} failed, {} bytes in {:.1}s{}",
        summary.category,
        summary.done,
        summary.skipped,
        summary.failed,
        summary.bytes,
        summary.elapsed.as_secs_f64(),
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    for failure in &summary.failures {
        println!(
            "  #{} {} [{}] {}",
            failure.unit_index, failure.unit_name, failure.kind, failure.reason
        );
    }
    Ok(())
}

async fn migrate(ctx: &AppContext) -> Result<()> {
    if !ctx.storage.has_legacy() {
        println!("No legacy store found");
        return Ok(());
    }
    for (namespace, outcome) in ctx.storage.migrate_all().await? {
        println!("{namespace}: {outcome:?}");
    }
    Ok(())
}

async fn status(ctx: &AppContext) -> Result<()> {
    let names = ctx.storage.namespaces().await?;
    if names.is_empty() {
        println!("No accounts stored under {}", ctx.config.data_dir.display());
        return Ok(());
    }
    for name in names {
        let ns = ctx.storage.open(&name).await?;
        let user: Option<SessionInfo> = get_json(ns.as_ref(), keys::USER_INFO).await?;
        match user {
            Some(user) => println!("{name}: user {}", user.user_id),
            None => println!("{name}: not logged in"),
        }
        let store = ResumeStore::new(ns);
        for category in Category::ALL {
            let counts = store.counts(category).await?;
            println!(
                "  {category:<8} {} done, {} partial, {} failed",
                counts.done, counts.partial, counts.failed
            );
        }
    }
    Ok(())
}
