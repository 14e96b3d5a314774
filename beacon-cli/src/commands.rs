use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use beacon_core::{ArchiveTick, SchedulerConfigPatch, StateStore, TaskStore};
use chrono::{NaiveDate, Utc};
use clap::Subcommand;
use tracing::warn;

use crate::host::Host;
use crate::stores::ArchiveShelf;

#[derive(Subcommand, Debug)]
pub enum ArchiveCommand {
    /// Run the archive pass now, ignoring the time and date gate
    Now,

    /// Show or change the daily archive schedule
    Config {
        #[command(subcommand)]
        command: ArchiveConfigCommand,
    },

    /// Case-insensitive search over archived tasks and notes
    Search { query: String },

    /// Items archived on a local calendar day (YYYY-MM-DD)
    Day { date: NaiveDate },

    /// Drop archived items older than N days
    Prune {
        #[arg(long, default_value_t = 90)]
        keep_days: i64,
    },

    /// Print this user's archive as JSON
    Export,

    /// Merge a file written by `archive export` back into the archive
    Import { file: PathBuf },

    /// Remove archived items by id
    Delete {
        #[arg(long = "task")]
        tasks: Vec<String>,

        #[arg(long = "note")]
        notes: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ArchiveConfigCommand {
    Show,

    Set {
        #[arg(long)]
        enabled: Option<bool>,

        /// Local wall-clock time, HH:MM
        #[arg(long)]
        time: Option<String>,

        /// Archive only completed tasks (and remove them from tasks.json)
        #[arg(long)]
        completed_only: Option<bool>,

        /// Run the analytics job after each pass
        #[arg(long)]
        analysis: Option<bool>,
    },
}

#[derive(Subcommand, Debug)]
pub enum RegionsCommand {
    /// Show registered geofence regions
    List,

    /// Forget registrations and register every enabled geofence again
    Replay,
}

pub async fn run(host: &Host) -> Result<()> {
    let mut engine = host.engine();
    engine.start().await?;
    println!(
        "beacon running for user {} ({}); loops: {}. Ctrl-C to stop.",
        host.user_id(),
        host.timezone,
        engine.active_loops().join(", ")
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    println!("stopping...");
    engine.stop().await?;
    Ok(())
}

/// One pass of each scheduler. A failing scheduler does not stop the others.
pub async fn tick(host: &Host) -> Result<()> {
    match host.reminders.tick().await {
        Ok(fired) if fired.is_empty() => println!("reminders: nothing due"),
        Ok(fired) => {
            for f in fired {
                println!("reminders: {} / {} ({:?})", f.task_id, f.reminder_id, f.kind);
            }
        }
        Err(e) => warn!(error = %e, "reminder tick failed"),
    }

    match host.geofence.tick().await {
        Ok(events) if events.is_empty() => println!("geofence: nothing fired"),
        Ok(events) => {
            for e in events {
                println!("geofence: {} {} at {:.0} m", e.task_id, e.trigger, e.distance_m);
            }
        }
        Err(e) => warn!(error = %e, "geofence tick failed"),
    }

    match host.archive.tick().await {
        Ok(outcome) => print_archive_outcome(outcome).await,
        Err(e) => warn!(error = %e, "archive tick failed"),
    }
    Ok(())
}

pub fn snooze(host: &Host, task: &str, reminder: &str, minutes: i64) -> Result<()> {
    let until = host.reminders.snooze(task, reminder, minutes)?;
    println!(
        "Snoozed {task}/{reminder} until {}",
        until.with_timezone(&host.timezone).format("%Y-%m-%d %H:%M")
    );
    Ok(())
}

pub fn reset(host: &Host, task: &str) -> Result<()> {
    let cleared = host.reminders.reset_task(task)?;
    println!("Cleared {cleared} ledger entries for {task}");
    Ok(())
}

pub async fn archive(host: &Host, cmd: ArchiveCommand) -> Result<()> {
    let user = host.user_id();
    match cmd {
        ArchiveCommand::Now => print_archive_outcome(host.archive.archive_now().await?).await,
        ArchiveCommand::Config { command } => archive_config(host, command)?,
        ArchiveCommand::Search { query } => print_shelf(&host.archive_store.search(user, &query)?),
        ArchiveCommand::Day { date } => {
            print_shelf(&host.archive_store.for_date(user, date, host.timezone)?)
        }
        ArchiveCommand::Prune { keep_days } => {
            let removed = host.archive_store.prune(user, keep_days, Utc::now())?;
            println!("Pruned {removed} archived items older than {keep_days} days");
        }
        ArchiveCommand::Export => {
            let shelf = host.archive_store.shelf(user)?;
            println!("{}", serde_json::to_string_pretty(&shelf)?);
        }
        ArchiveCommand::Import { file } => {
            let raw = fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
            let shelf: ArchiveShelf =
                serde_json::from_str(&raw).with_context(|| format!("parse {} as an archive export", file.display()))?;
            let (tasks, notes) = host.archive_store.import(user, &shelf)?;
            println!("Imported {tasks} tasks and {notes} notes");
        }
        ArchiveCommand::Delete { tasks, notes } => {
            if tasks.is_empty() && notes.is_empty() {
                bail!("nothing to delete: pass --task <id> and/or --note <id>");
            }
            let (tasks, notes) = host.archive_store.delete(user, &tasks, &notes)?;
            println!("Deleted {tasks} tasks and {notes} notes from the archive");
        }
    }
    Ok(())
}

fn archive_config(host: &Host, cmd: ArchiveConfigCommand) -> Result<()> {
    match cmd {
        ArchiveConfigCommand::Show => {
            let cfg = host.archive.config()?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        ArchiveConfigCommand::Set {
            enabled,
            time,
            completed_only,
            analysis,
        } => {
            let change = host.archive.update_config(&SchedulerConfigPatch {
                enabled,
                archive_time: time,
                archive_completed_only: completed_only,
                enable_ai_analysis: analysis,
            })?;
            println!("{}", serde_json::to_string_pretty(&change.config)?);
            if change.enabled_changed {
                println!("Archive schedule {}; restart `beacon run` to apply.", on_off(change.config.enabled));
            }
        }
    }
    Ok(())
}

pub async fn regions(host: &Host, cmd: RegionsCommand) -> Result<()> {
    match cmd {
        RegionsCommand::List => {
            let regions = host.regions.list()?;
            if regions.is_empty() {
                println!("No regions registered");
            }
            for r in regions.values() {
                println!(
                    "{:<16} {:<5} {:>8.0} m  ({:.5}, {:.5})",
                    r.id,
                    r.mode.to_string(),
                    r.radius,
                    r.lat,
                    r.lng
                );
            }
        }
        RegionsCommand::Replay => {
            let count = host.geofence.replay_regions().await?;
            println!("Registered {count} regions");
        }
    }
    Ok(())
}

pub async fn status(host: &Host) -> Result<()> {
    let tasks = host.tasks.list_tasks()?;
    let open: Vec<_> = tasks.iter().filter(|t| t.is_open()).collect();
    let pending = open
        .iter()
        .flat_map(|t| t.reminders.iter())
        .filter(|r| !r.is_spent())
        .count();
    let geofences = open.iter().filter(|t| t.active_geo().is_some()).count();
    let notified = host.state.keys_with_prefix("reminder:").len();
    let inside = host
        .state
        .keys_with_prefix("geo:")
        .iter()
        .filter(|k| matches!(host.state.flag(k), Ok(Some(true))))
        .count();

    println!("Home:              {}", host.layout.root().display());
    println!("User:              {} ({})", host.user_id(), host.timezone);
    println!("Open tasks:        {} of {}", open.len(), tasks.len());
    println!("Pending reminders: {pending}");
    println!("Ledger entries:    {notified}");
    println!("Geofences:         {geofences} enabled, {} registered, inside {inside}", host.regions.list()?.len());

    let cfg = host.archive.config()?;
    let last = host
        .archive
        .last_archive_date()
        .await?
        .map_or_else(|| "never".to_string(), |d| d.to_string());
    println!(
        "Daily archive:     {} at {} ({}), last run {last}",
        on_off(cfg.enabled),
        cfg.archive_time,
        if cfg.archive_completed_only { "completed only" } else { "all items" },
    );
    Ok(())
}

async fn print_archive_outcome(outcome: ArchiveTick) {
    match outcome {
        ArchiveTick::Disabled => println!("archive: disabled"),
        ArchiveTick::NotYetDue => println!("archive: not yet due"),
        ArchiveTick::AlreadyArchived(date) => println!("archive: already ran for {date}"),
        ArchiveTick::InFlight => println!("archive: pass already running"),
        ArchiveTick::Archived(report) => {
            println!(
                "archive: {} tasks, {} notes archived for {} ({} removed from tasks.json)",
                report.tasks_archived, report.notes_archived, report.date, report.tasks_removed
            );
            // One-shot commands exit right after, so let analytics finish.
            if let Some(job) = report.analytics {
                if let Err(e) = job.await {
                    warn!(error = %e, "analytics task panicked");
                }
            }
        }
    }
}

fn print_shelf(shelf: &ArchiveShelf) {
    if shelf.is_empty() {
        println!("No archived items");
        return;
    }
    for t in &shelf.tasks {
        let when = t.archived_at.map(|a| a.format("%Y-%m-%d").to_string()).unwrap_or_default();
        let done = if t.completed { "x" } else { " " };
        println!("[{done}] {:<12} {when}  {}", t.id, t.text);
    }
    for n in &shelf.notes {
        let when = n.archived_at.map(|a| a.format("%Y-%m-%d").to_string()).unwrap_or_default();
        println!("note {:<12} {when}  {}", n.id, n.text);
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}
