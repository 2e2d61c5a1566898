use anyhow::{bail, Context, Result};
use biocore::{compute_state, BioCoreConfig, EvolutionStage};
use chrono::TimeZone;
use clap::{Args, Parser, Subcommand};
use ledger::{Document, EpochMillis, EventKind, SystemClock};
use replica::{
    AccountId, InMemoryRemote, LifecycleEvent, RemoteStore, ResetConfirmation, SessionContext,
    SyncConfig, SyncScheduler, SyncSession, WsRemote,
};
use std::path::PathBuf;
use std::sync::Arc;
use store::SqliteKv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "habit-cli")]
#[command(about = "Habit tracker CLI - offline-first event log, metrics and sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the local cache database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Account whose document is used
    #[arg(short, long, global = true, default_value = "local")]
    account: String,

    /// Document server URL (ws://host:port). Runs offline when omitted
    #[arg(long, global = true)]
    server: Option<String>,

    /// JSON file overriding the sync configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the document, derived metrics and today's figures
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Log an event at the current time
    Log {
        /// Mark the event as an override (larger penalty)
        #[arg(long = "override")]
        is_override: bool,
    },

    /// Remove the most recent event
    Undo,

    /// Show or change settings
    Settings(SettingsArgs),

    /// Wipe all history and settings on every device
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    /// Reconcile with the server once
    Sync,

    /// Keep syncing and print every state change until interrupted
    Watch,

    /// Merge an exported or legacy JSON document into the current one
    Import {
        /// Document file path
        file: PathBuf,
    },

    /// Bring back events from the local backup snapshot
    Recover,
}

#[derive(Args)]
struct SettingsArgs {
    /// Price of one pack
    #[arg(long)]
    unit_price: Option<f64>,

    #[arg(long)]
    units_per_pack: Option<i64>,

    /// Daily count before starting
    #[arg(long)]
    baseline: Option<i64>,

    /// Minimum minutes between events
    #[arg(long)]
    min_interval: Option<i64>,

    /// Daily target
    #[arg(long)]
    target: Option<i64>,
}

impl SettingsArgs {
    fn is_empty(&self) -> bool {
        self.unit_price.is_none()
            && self.units_per_pack.is_none()
            && self.baseline.is_none()
            && self.min_interval.is_none()
            && self.target.is_none()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    let online = cli.server.is_some();
    let mut session = open_session(&cli, config)?;

    match cli.command {
        Commands::Status { json } => {
            pull_if_online(&mut session, online).await;
            print_status(&session, json)
        }
        Commands::Log { is_override } => {
            pull_if_online(&mut session, online).await;
            let kind = if is_override {
                EventKind::Override
            } else {
                EventKind::Normal
            };
            match session.log_event(kind) {
                Some(event) => println!("Logged {} event at {}", kind, format_time(event.timestamp)),
                None => warn!("An event already exists at this instant; nothing logged"),
            }
            push_if_online(&mut session, online).await;
            Ok(())
        }
        Commands::Undo => {
            pull_if_online(&mut session, online).await;
            match session.undo_last() {
                Some(event) => println!("Removed event at {}", format_time(event.timestamp)),
                None => println!("Nothing to undo"),
            }
            push_if_online(&mut session, online).await;
            Ok(())
        }
        Commands::Settings(args) => settings_command(&mut session, args, online).await,
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset discards every event on every device; pass --yes to confirm");
            }
            let outcome = session
                .reset_all(ResetConfirmation::confirmed_by_user())
                .await;
            if outcome.remote_confirmed {
                println!("Reset complete");
            } else {
                println!("Reset locally; it will reach the server on the next connected run");
            }
            Ok(())
        }
        Commands::Sync => {
            if !online {
                bail!("sync needs --server");
            }
            session.pull().await.context("pulling remote document")?;
            session.force_push().await.context("pushing document")?;
            print_status(&session, false)
        }
        Commands::Recover => {
            pull_if_online(&mut session, online).await;
            match session.restore_from_backup() {
                0 => println!("Backup holds nothing the current history lacks"),
                n => println!("Restored {} events from backup", n),
            }
            push_if_online(&mut session, online).await;
            Ok(())
        }
        Commands::Watch => watch_command(session).await,
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            pull_if_online(&mut session, online).await;
            let added = session
                .import_json(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;
            println!("Imported {} new events", added);
            push_if_online(&mut session, online).await;
            Ok(())
        }
    }
}

fn open_session(cli: &Cli, config: SyncConfig) -> Result<SyncSession> {
    let db_path = match &cli.data_dir {
        Some(dir) => dir.join("local_cache.sqlite"),
        None => store::default_db_path(),
    };
    let kv = SqliteKv::open_or_create(&db_path)?;
    info!("Using local cache {:?}", db_path);

    let remote: Arc<dyn RemoteStore> = match &cli.server {
        Some(url) => Arc::new(WsRemote::new(url.clone())),
        None => Arc::new(InMemoryRemote::offline()),
    };

    Ok(SyncSession::open(SessionContext {
        account: AccountId::new(cli.account.clone()),
        kv: Arc::new(kv),
        remote,
        clock: Arc::new(SystemClock),
        config,
    }))
}

async fn pull_if_online(session: &mut SyncSession, online: bool) {
    if online {
        if let Err(e) = session.pull().await {
            warn!("Pull failed, continuing with the local copy: {}", e);
        }
    }
}

async fn push_if_online(session: &mut SyncSession, online: bool) {
    if online {
        if let Err(e) = session.push().await {
            warn!("Push failed, changes stay local: {}", e);
        }
    }
}

async fn settings_command(
    session: &mut SyncSession,
    args: SettingsArgs,
    online: bool,
) -> Result<()> {
    pull_if_online(session, online).await;

    if !args.is_empty() {
        let mut settings = session.current_state().settings.clone();
        if let Some(v) = args.unit_price {
            settings.unit_price = v;
        }
        if let Some(v) = args.units_per_pack {
            settings.units_per_pack = v;
        }
        if let Some(v) = args.baseline {
            settings.baseline_daily_count = v;
        }
        if let Some(v) = args.min_interval {
            settings.min_interval_minutes = v;
        }
        if let Some(v) = args.target {
            settings.target_daily_count = v;
        }
        session.save_settings(settings);
        push_if_online(session, online).await;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&session.current_state().settings)?
    );
    Ok(())
}

async fn watch_command(session: SyncSession) -> Result<()> {
    let biocore = session.config().biocore.clone();
    let handle = SyncScheduler::spawn(session);
    let mut state = handle.state();
    print_summary(&state.borrow_and_update(), &biocore);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let doc = state.borrow_and_update().clone();
                print_summary(&doc, &biocore);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, flushing pending changes");
                break;
            }
        }
    }

    if let Err(e) = handle.lifecycle(LifecycleEvent::Backgrounded) {
        warn!("Final push not scheduled: {}", e);
    }
    let session = handle.shutdown().await?;
    if session.is_dirty() {
        warn!("Some changes have not reached the server yet");
    }
    Ok(())
}

fn print_summary(doc: &Document, config: &BioCoreConfig) {
    let now = chrono::Utc::now().timestamp_millis();
    let state = compute_state(&doc.events, doc.profile.profile_start_time, now, config);
    println!(
        "[{}] {} events, integrity {:.1}%, stage {}, revision {}",
        format_time(now),
        doc.events.len(),
        state.integrity,
        state.stage(),
        doc.document_revision_time
    );
}

fn print_status(session: &SyncSession, json: bool) -> Result<()> {
    let now = session.now();
    let doc = session.current_state();
    let state = session.derive_metrics(now);
    let today = session.daily_stats(now);

    if json {
        let out = serde_json::json!({
            "account": session.account(),
            "document": doc,
            "metrics": state,
            "stage": state.stage(),
            "today": today,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let stage = state.stage();
    let last = doc
        .last_event_time()
        .map(format_time)
        .unwrap_or_else(|| "never".to_string());

    println!("Account:        {}", session.account());
    println!("Profile start:  {}", format_time(doc.profile.profile_start_time));
    println!("Events:         {} (last {})", doc.events.len(), last);
    println!("Integrity:      {:.1}%", state.integrity);
    match stage.next() {
        Some(next) => println!(
            "Stage:          {} ({:.0}% to {})",
            stage,
            EvolutionStage::progress(state.evolution_duration_ms) * 100.0,
            next
        ),
        None => println!("Stage:          {}", stage),
    }
    println!(
        "Abstention:     {}h now, {}h record",
        state.current_abstention_hours(),
        doc.profile
            .longest_abstention_hours
            .max(state.longest_abstention_hours())
    );
    println!(
        "Today:          {} of {} (spent {:.2}, planned {:.2})",
        today.events_today, today.target_today, today.spent_today, today.planned_spend_today
    );
    println!("Money saved:    {:.2}", today.money_saved);
    if today.next_allowed_in_ms > 0 {
        println!(
            "Next allowed:   in {} min",
            (today.next_allowed_in_ms + 59_999) / 60_000
        );
    }
    Ok(())
}

fn format_time(ms: EpochMillis) -> String {
    chrono::Local
        .timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}
