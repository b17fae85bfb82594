//! # Nudge — personal reminder daemon
//!
//! Usage:
//!   nudge run                                        # Start the notifier loop
//!   nudge event add --user 1 --at "2026-11-02 09:30" --text "Dentist"
//!   nudge periodic add --user 1 --time 08:00 --min-days 1 --max-days 3 --text "Stretch"
//!   nudge defaults set --user 1 --channel telegram:123456789

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use nudge_core::NudgeConfig;
use nudge_core::types::{
    ChannelSelector, DAY, NotificationParams, OneShotItem, RecurringDefinition, UserId,
};
use nudge_scheduler::{
    ChannelNotifier, JobConfig, NotifierJob, OccurrenceGenerator, ReminderService,
    SqliteRepository,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "nudge", version, about = "⏰ Nudge — reminders that arrive on time")]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "~/.nudge/config.toml")]
    config: String,

    /// Database path (overrides the config file)
    #[arg(long = "db")]
    db_path: Option<String>,

    /// Fallback check period in seconds (overrides the config file)
    #[arg(long)]
    check_period: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the notifier loop until Ctrl-C
    Run,
    /// One-shot reminders
    #[command(subcommand)]
    Event(EventCommand),
    /// Periodic reminders
    #[command(subcommand)]
    Periodic(PeriodicCommand),
    /// Per-user notification defaults
    #[command(subcommand)]
    Defaults(DefaultsCommand),
}

#[derive(Subcommand)]
enum EventCommand {
    Add {
        #[arg(short, long)]
        user: UserId,
        /// RFC 3339, or "YYYY-MM-DD HH:MM" in UTC
        #[arg(long)]
        at: String,
        #[arg(short, long)]
        text: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Override the user's default channel, e.g. webhook:https://…
        #[arg(long)]
        channel: Option<ChannelSelector>,
    },
    List {
        #[arg(short, long)]
        user: UserId,
    },
    Done {
        id: Uuid,
    },
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum PeriodicCommand {
    Add {
        #[arg(short, long)]
        user: UserId,
        /// Time of day, HH:MM in UTC
        #[arg(long)]
        time: String,
        #[arg(long, default_value = "1")]
        min_days: u32,
        #[arg(long, default_value = "1")]
        max_days: u32,
        #[arg(short, long)]
        text: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long)]
        channel: Option<ChannelSelector>,
    },
    List {
        #[arg(short, long)]
        user: UserId,
    },
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum DefaultsCommand {
    Set {
        #[arg(short, long)]
        user: UserId,
        /// telegram:<chat id>, webhook:<url> or command:<program> [args…]
        #[arg(long)]
        channel: ChannelSelector,
        /// Repeat cadence hint for the channel, in minutes
        #[arg(long, default_value = "60")]
        period_mins: u64,
    },
}

struct App {
    job: Arc<NotifierJob>,
    service: ReminderService<SqliteRepository>,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(cli: &Cli) -> Result<NudgeConfig> {
    let path = expand_path(&cli.config);
    let mut config = if Path::new(&path).exists() {
        NudgeConfig::load_from(Path::new(&path))?
    } else {
        NudgeConfig::default()
    };
    if let Some(db_path) = &cli.db_path {
        config.database_path = db_path.clone();
    }
    if let Some(secs) = cli.check_period {
        config.scheduler.check_period_secs = secs;
    }
    Ok(config)
}

fn build(config: &NudgeConfig) -> Result<App> {
    let db_path = config.database_path();
    let repo = Arc::new(
        SqliteRepository::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    let notifier = Arc::new(ChannelNotifier::from_config(config));
    let generator = OccurrenceGenerator::default();
    let job = Arc::new(NotifierJob::new(
        repo.clone(),
        notifier.clone(),
        generator.clone(),
        JobConfig::from(&config.scheduler),
    ));
    let service = ReminderService::new(repo, notifier, job.clone(), generator);
    Ok(App { job, service })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .with_context(|| format!("'{s}' is neither RFC 3339 nor YYYY-MM-DD HH:MM"))?;
    Ok(naive.and_utc())
}

fn parse_day_offset(s: &str) -> Result<Duration> {
    let time = NaiveTime::parse_from_str(s, "%H:%M")
        .with_context(|| format!("'{s}' is not HH:MM"))?;
    let offset = time.signed_duration_since(NaiveTime::MIN);
    Ok(offset.to_std()?)
}

fn channel_params(channel: Option<ChannelSelector>) -> Option<NotificationParams> {
    channel.map(|channel| NotificationParams {
        period: Duration::from_secs(3600),
        channel,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "nudge=debug,nudge_scheduler=debug,nudge_core=debug"
    } else {
        "nudge=info,nudge_scheduler=info,nudge_core=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = load_config(&cli)?;
    let app = build(&config)?;

    match cli.command {
        Command::Run => run(app, &config).await?,
        Command::Event(cmd) => event(&app, cmd).await?,
        Command::Periodic(cmd) => periodic(&app, cmd).await?,
        Command::Defaults(DefaultsCommand::Set {
            user,
            channel,
            period_mins,
        }) => {
            let params = NotificationParams {
                period: Duration::from_secs(period_mins * 60),
                channel,
            };
            app.service.set_default_params(user, params.clone()).await?;
            println!("✅ User {user} defaults: {} every {period_mins}m", params.channel);
        }
    }
    Ok(())
}

async fn run(app: App, config: &NudgeConfig) -> Result<()> {
    println!("⏰ Nudge v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:       {}", config.database_path().display());
    println!(
        "   🔁 Fallback check: every {}s",
        config.scheduler.check_period().as_secs()
    );
    println!(
        "   📨 Telegram:       {}",
        if config.telegram_token().is_some() { "enabled" } else { "disabled" }
    );
    println!();

    let shutdown = CancellationToken::new();
    let handle = app.job.clone().spawn(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("🛑 Shutting down");
    shutdown.cancel();
    handle.await?;
    Ok(())
}

async fn event(app: &App, cmd: EventCommand) -> Result<()> {
    match cmd {
        EventCommand::Add {
            user,
            at,
            text,
            description,
            channel,
        } => {
            let mut item = OneShotItem::new(user, &text, parse_time(&at)?);
            item.description = description;
            item.params = channel_params(channel);
            let item = app.service.create_event(item).await?;
            println!("✅ Event {} at {}", item.id, item.send_time);
        }
        EventCommand::List { user } => {
            let items = app.service.list_events(user).await?;
            if items.is_empty() {
                println!("No events for user {user}.");
            }
            for item in items {
                let state = if item.done {
                    "done"
                } else if item.notified {
                    "sent"
                } else {
                    "pending"
                };
                let at = item.send_time.format("%Y-%m-%d %H:%M");
                println!("{}  {at}  [{state}]  {}", item.id, item.text);
            }
        }
        EventCommand::Done { id } => {
            app.service.mark_event_done(id).await?;
            println!("✅ Event {id} done");
        }
        EventCommand::Delete { id } => {
            app.service.delete_event(id).await?;
            println!("🗑️  Event {id} deleted");
        }
    }
    Ok(())
}

async fn periodic(app: &App, cmd: PeriodicCommand) -> Result<()> {
    match cmd {
        PeriodicCommand::Add {
            user,
            time,
            min_days,
            max_days,
            text,
            description,
            channel,
        } => {
            let mut definition = RecurringDefinition::new(
                user,
                &text,
                parse_day_offset(&time)?,
                DAY * min_days,
                DAY * max_days,
            );
            definition.description = description;
            definition.params = channel_params(channel);
            let (definition, first) = app.service.create_periodic(definition).await?;
            println!("✅ Periodic event {} first at {}", definition.id, first.send_time);
        }
        PeriodicCommand::List { user } => {
            let definitions = app.service.list_periodic(user).await?;
            if definitions.is_empty() {
                println!("No periodic events for user {user}.");
            }
            for def in definitions {
                let next = match app.service.pending_occurrence(def.id).await {
                    Ok(occ) => occ.send_time.format("%Y-%m-%d %H:%M").to_string(),
                    Err(e) if e.is_not_found() => "-".into(),
                    Err(e) => return Err(e.into()),
                };
                println!(
                    "{}  every {}-{}d  next {next}  {}",
                    def.id,
                    def.smallest_period.as_secs() / DAY.as_secs(),
                    def.biggest_period.as_secs() / DAY.as_secs(),
                    def.text
                );
            }
        }
        PeriodicCommand::Delete { id } => {
            app.service.delete_periodic(id).await?;
            println!("🗑️  Periodic event {id} deleted");
        }
    }
    Ok(())
}
