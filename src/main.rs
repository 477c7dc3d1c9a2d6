//! # PostPilot — Scheduled Publication Engine
//!
//! Schedules social posts across Facebook, Instagram, LinkedIn, and
//! Twitter, and delivers them resiliently: encrypted credentials with
//! proactive refresh, retry with backoff, and recurring posts.
//!
//! Usage:
//!   postpilot serve                          # Run the poller daemon
//!   postpilot task add --user u1 ...         # Schedule a post
//!   postpilot task list --user u1            # Show a user's tasks
//!   postpilot credential set --user u1 ...   # Connect an account

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use postpilot_core::{Platform, PostPayload, PostPilotConfig};
use postpilot_credentials::{Credential, CredentialManager, HttpTokenRefresher};
use postpilot_dispatch::Dispatcher;
use postpilot_engine::tasks::RecurrencePattern;
use postpilot_engine::{NewTask, Recurrence, TaskDb, TaskEngine, spawn_poller};
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "postpilot",
    version,
    about = "📅 PostPilot — Scheduled Publication Engine"
)]
struct Cli {
    /// Config file (default: ~/.postpilot/config.toml)
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
    /// Run the poller daemon
    Serve,
    /// Manage scheduled tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Manage connected accounts
    #[command(subcommand)]
    Credential(CredentialCommand),
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Schedule a post
    Add {
        #[arg(long)]
        user: String,
        /// Target platform: facebook, instagram, linkedin, twitter
        #[arg(long)]
        platform: String,
        /// Provider-side resource id (page id, account id, author URN id)
        #[arg(long)]
        network: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        image_url: Option<String>,
        #[arg(long)]
        link_url: Option<String>,
        /// When to publish (RFC 3339, e.g. 2026-09-01T09:00:00Z)
        #[arg(long)]
        at: String,
        /// Repeat: daily, weekly, monthly
        #[arg(long)]
        recur: Option<String>,
        /// Time of day for recurring posts (HH:MM, UTC)
        #[arg(long)]
        time: Option<String>,
        /// Weekly recurrence: 0 = Sunday … 6 = Saturday
        #[arg(long)]
        day_of_week: Option<u32>,
        /// Monthly recurrence: 1-31
        #[arg(long)]
        day_of_month: Option<u32>,
        /// Stop recurring after this point (RFC 3339)
        #[arg(long)]
        until: Option<String>,
    },
    /// List a user's tasks
    List {
        #[arg(long)]
        user: String,
    },
    /// Cancel a pending task
    Cancel { id: String },
    /// Delete a task (published posts stay on record)
    Delete {
        id: String,
        #[arg(long)]
        user: String,
    },
    /// Publish a pending task immediately
    RunNow { id: String },
}

#[derive(Subcommand)]
enum CredentialCommand {
    /// Store (or replace) a user's token for a platform
    Set {
        #[arg(long)]
        user: String,
        #[arg(long)]
        platform: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Days until the token expires (omit for non-expiring tokens)
        #[arg(long)]
        expires_in_days: Option<i64>,
        /// Per-resource tokens as id=token pairs (page tokens,
        /// oauth_token_secret for Twitter)
        #[arg(long)]
        resource: Vec<String>,
    },
    /// List stored credentials (never prints token material)
    List,
    /// Remove a stored credential
    Remove {
        #[arg(long)]
        user: String,
        #[arg(long)]
        platform: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "postpilot=debug"
    } else {
        "postpilot=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => PostPilotConfig::load_from(std::path::Path::new(path))?,
        None => PostPilotConfig::load()?,
    };

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let credentials = Arc::new(CredentialManager::open(
        &data_dir.join("credentials.db"),
        config.credentials.encrypt,
        config.credentials.refresh_margin_days,
        Arc::new(HttpTokenRefresher::new(config.platforms.clone())),
    )?);
    let dispatcher = Arc::new(Dispatcher::with_default_adapters(
        credentials.clone(),
        &config.platforms,
    ));
    let db = Arc::new(tokio::sync::Mutex::new(TaskDb::open(
        &data_dir.join("tasks.db"),
    )?));
    let engine = Arc::new(TaskEngine::new(
        db,
        dispatcher,
        credentials.clone(),
        config.poller.retry_cooldown_secs,
    ));

    match cli.command {
        Command::Serve => {
            println!("📅 PostPilot v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Data Dir:  {}", data_dir.display());
            println!("   ⏱️  Poll:      every {}s", config.poller.interval_secs);
            println!(
                "   🔑 Sweep:     every {}s",
                config.poller.sweep_interval_secs
            );
            println!("   🧵 Workers:   {}", config.poller.max_concurrent);
            println!();

            let poller = spawn_poller(engine, credentials, &config.poller);
            tokio::signal::ctrl_c().await?;
            println!("\n👋 Shutting down");
            poller.abort();
        }
        Command::Task(cmd) => run_task_command(&engine, cmd).await?,
        Command::Credential(cmd) => run_credential_command(&credentials, cmd).await?,
    }

    Ok(())
}

async fn run_task_command(engine: &Arc<TaskEngine>, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Add {
            user,
            platform,
            network,
            title,
            body,
            image_url,
            link_url,
            at,
            recur,
            time,
            day_of_week,
            day_of_month,
            until,
        } => {
            let platform = Platform::from_str(&platform).map_err(|e| anyhow::anyhow!("{e}"))?;
            let scheduled_for = parse_rfc3339(&at)?;
            let recurrence = match recur {
                Some(pattern) => Some(build_recurrence(
                    &pattern,
                    time.as_deref(),
                    day_of_week,
                    day_of_month,
                    until.as_deref(),
                    scheduled_for,
                )?),
                None => None,
            };

            let mut payload = PostPayload::new(&title, &body);
            payload.image_url = image_url;
            payload.link_url = link_url;

            let task = engine
                .create(NewTask {
                    user_id: user,
                    network_id: network,
                    platform,
                    payload,
                    scheduled_for,
                    recurrence,
                })
                .await?;
            println!("✅ Task {} scheduled for {}", task.id, at);
        }
        TaskCommand::List { user } => {
            let tasks = engine.tasks_for_user(&user).await?;
            if tasks.is_empty() {
                println!("No tasks for {user}.");
            }
            for task in tasks {
                let recur = match &task.recurrence {
                    Some(r) => format!(" ({:?})", r.pattern).to_lowercase(),
                    None => String::new(),
                };
                println!(
                    "  {} [{}] {} @ {}{}  {}",
                    task.id,
                    task.status.as_str(),
                    task.platform,
                    task.scheduled_for.to_rfc3339(),
                    recur,
                    task.last_error.as_deref().unwrap_or("")
                );
            }
        }
        TaskCommand::Cancel { id } => {
            engine.cancel(&id).await?;
            println!("🚫 Task {id} cancelled");
        }
        TaskCommand::Delete { id, user } => {
            if engine.delete(&id, &user).await? {
                println!("🗑️  Task {id} deleted");
            } else {
                println!("⚠️  Task {id} not deleted (published, or not yours)");
            }
        }
        TaskCommand::RunNow { id } => {
            let task = engine.run_now(&id).await?;
            println!(
                "{} Task {} → {}",
                match task.status {
                    postpilot_engine::TaskStatus::Published => "✅",
                    _ => "⚠️",
                },
                task.id,
                task.status.as_str()
            );
            if let Some(err) = task.last_error {
                println!("   {err}");
            }
        }
    }
    Ok(())
}

async fn run_credential_command(
    credentials: &Arc<CredentialManager>,
    cmd: CredentialCommand,
) -> Result<()> {
    match cmd {
        CredentialCommand::Set {
            user,
            platform,
            access_token,
            refresh_token,
            expires_in_days,
            resource,
        } => {
            let platform = Platform::from_str(&platform).map_err(|e| anyhow::anyhow!("{e}"))?;
            let mut credential = Credential::new(&user, platform, &access_token);
            credential.refresh_token = refresh_token;
            credential.expires_at = expires_in_days.map(|d| Utc::now() + chrono::Duration::days(d));
            for pair in resource {
                let Some((id, token)) = pair.split_once('=') else {
                    anyhow::bail!("--resource wants id=token, got '{pair}'");
                };
                credential
                    .resource_tokens
                    .insert(id.to_string(), token.to_string());
            }
            credentials.store_credential(&credential).await?;
            println!("🔑 {platform} credential stored for {user}");
        }
        CredentialCommand::List => {
            let entries = credentials.list().await?;
            if entries.is_empty() {
                println!("No credentials stored.");
            }
            for (user, platform, expires_at) in entries {
                let expiry = expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!("  {user} / {platform}  expires: {expiry}");
            }
        }
        CredentialCommand::Remove { user, platform } => {
            let platform = Platform::from_str(&platform).map_err(|e| anyhow::anyhow!("{e}"))?;
            if credentials.remove(&user, platform).await? {
                println!("🗑️  {platform} credential removed for {user}");
            } else {
                println!("⚠️  Nothing stored for {user} / {platform}");
            }
        }
    }
    Ok(())
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("'{s}' is not RFC 3339: {e}"))?
        .with_timezone(&Utc))
}

fn build_recurrence(
    pattern: &str,
    time: Option<&str>,
    day_of_week: Option<u32>,
    day_of_month: Option<u32>,
    until: Option<&str>,
    scheduled_for: DateTime<Utc>,
) -> Result<Recurrence> {
    let pattern = match pattern {
        "daily" => RecurrencePattern::Daily,
        "weekly" => RecurrencePattern::Weekly,
        "monthly" => RecurrencePattern::Monthly,
        other => anyhow::bail!("unknown recurrence '{other}' (daily, weekly, monthly)"),
    };
    // Default the occurrence time to the first post's time.
    let time_of_day = match time {
        Some(t) => NaiveTime::parse_from_str(t, "%H:%M")
            .map_err(|e| anyhow::anyhow!("'{t}' is not HH:MM: {e}"))?,
        None => scheduled_for.time(),
    };
    let ends_at = until.map(parse_rfc3339).transpose()?;
    Ok(Recurrence {
        pattern,
        time_of_day,
        day_of_week,
        day_of_month,
        ends_at,
    })
}
