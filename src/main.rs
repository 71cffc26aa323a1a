//! # Notecall: spaced reminders for your own notes
//!
//! Every other day, at a random time inside the reminder window, each user
//! gets one of their saved notes back.
//!
//! Usage:
//!   notecall run                     # Start the reminder scheduler
//!   notecall run --dry-run           # Log reminders instead of sending them
//!   notecall test --user 12345       # Send one random note now
//!   notecall next --user 12345       # Show the next scheduled reminder
//!   notecall stats                   # Scheduler statistics

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use notecall_channels::{ConsoleDelivery, TelegramDelivery};
use notecall_core::traits::{DeliveryChannel, SystemClock};
use notecall_core::NotecallConfig;
use notecall_scheduler::{
    EngineSettings, NoteDb, ReminderEngine, RestartPolicy, Shutdown, Supervisor,
};

#[derive(Parser)]
#[command(
    name = "notecall",
    version,
    about = "📚 Notecall: re-surfaces your saved notes at random moments"
)]
struct Cli {
    /// Config file (default: ~/.notecall/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reminder scheduler until Ctrl-C
    Run {
        /// Log reminders instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Send a random note to a user right away
    Test {
        #[arg(short, long)]
        user: String,
    },
    /// Show when a user's next reminder fires
    Next {
        #[arg(short, long)]
        user: String,
    },
    /// Show scheduler statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "notecall=debug,notecall_scheduler=debug,notecall_channels=debug"
    } else {
        "notecall=info,notecall_scheduler=info,notecall_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let db_path = config.db_path();
    let db = Arc::new(
        NoteDb::open(&db_path)
            .with_context(|| format!("opening note database {}", db_path.display()))?,
    );
    tracing::debug!("📂 Note database: {}", db_path.display());

    match cli.command {
        Command::Run { dry_run } => {
            let engine = build_engine(db, make_channel(&config, dry_run)?, &config)?;
            run(Arc::new(engine), &config).await?;
        }
        Command::Test { user } => {
            let engine = build_engine(db, make_channel(&config, false)?, &config)?;
            if engine.send_test_reminder(&user).await? {
                println!("✅ Test reminder sent to {user}");
            } else {
                println!("📭 User {user} has no notes yet");
            }
        }
        Command::Next { user } => {
            let engine = build_engine(db, Arc::new(ConsoleDelivery::new()), &config)?;
            match engine.next_reminder_at(&user).await? {
                Some(at) => println!("⏰ Next reminder for {user}: {at}"),
                None => println!("💤 No reminder scheduled for {user}"),
            }
        }
        Command::Stats => {
            let engine = build_engine(db.clone(), Arc::new(ConsoleDelivery::new()), &config)?;
            let stats = engine.stats().await?;
            let window = &engine.settings().window;
            println!("📊 Notecall Scheduler");
            println!("   Users:               {}", stats.total_users);
            println!("   Notes:               {}", stats.total_notes);
            println!("   Scheduled reminders: {}", stats.scheduled_reminders);
            println!(
                "   Window:              {:02}:00-{:02}:00, every {} day(s)",
                window.start_hour, window.end_hour, window.interval_days
            );
            let recent = db.recent_outcomes(5)?;
            if !recent.is_empty() {
                println!("\n🕘 Recent reminders:");
                for record in recent {
                    println!("   {}  {:<12} {}", record.at, record.user_id, record.outcome);
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<NotecallConfig> {
    let mut config = match path {
        Some(p) => NotecallConfig::load_from(&PathBuf::from(shellexpand::tilde(p).to_string()))?,
        None => NotecallConfig::load()?,
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn make_channel(config: &NotecallConfig, dry_run: bool) -> Result<Arc<dyn DeliveryChannel>> {
    if dry_run {
        tracing::info!("🧪 Dry run: reminders are logged, not sent");
        return Ok(Arc::new(ConsoleDelivery::new()));
    }
    Ok(Arc::new(TelegramDelivery::new(config.telegram.clone())?))
}

fn build_engine(
    db: Arc<NoteDb>,
    channel: Arc<dyn DeliveryChannel>,
    config: &NotecallConfig,
) -> Result<ReminderEngine> {
    Ok(ReminderEngine::new(
        db,
        channel,
        Arc::new(SystemClock),
        EngineSettings::from_config(config)?,
    ))
}

/// Supervise the engine until Ctrl-C.
async fn run(engine: Arc<ReminderEngine>, config: &NotecallConfig) -> Result<()> {
    let shutdown = Arc::new(Shutdown::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => shutdown.trigger(),
                Err(e) => tracing::error!("❌ Cannot listen for Ctrl-C: {e}"),
            }
        }
    });

    let supervisor = Supervisor::new(
        "reminder engine",
        RestartPolicy::from_config(&config.supervisor),
        engine.tick_counter(),
    );
    let signal = shutdown.signal();
    supervisor
        .run(
            || {
                let engine = engine.clone();
                let signal = signal.clone();
                async move { engine.run(signal).await }
            },
            shutdown.signal(),
        )
        .await?;

    tracing::info!("👋 Notecall stopped");
    Ok(())
}
