use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod host;
mod state;
mod stores;

use commands::{ArchiveCommand, RegionsCommand};
use host::Host;
use state::Layout;

#[derive(Parser, Debug)]
#[command(
    name = "beacon",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BEACON_BUILD_SHA"), ")"),
    about = "Reminder, geofence and daily archive triggers over ~/.beacon"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all trigger loops until Ctrl-C
    Run,

    /// Run one pass of every scheduler and print what fired
    Tick,

    /// Re-arm a fired reminder N minutes from now
    Snooze {
        #[arg(long)]
        task: String,

        #[arg(long)]
        reminder: String,

        #[arg(long, default_value_t = 10)]
        minutes: i64,
    },

    /// Forget that a task's reminders fired (after editing its schedule)
    Reset {
        #[arg(long)]
        task: String,
    },

    /// Daily archive: manual pass, schedule, and archive queries
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },

    /// Geofence region registrations
    Regions {
        #[command(subcommand)]
        command: RegionsCommand,
    },

    /// config.toml management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Summary of tasks, reminders, geofences and the archive
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the default config.toml (no-op when it exists)
    Init,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let layout = Layout::discover()?;

    if let Command::Config { command } = &cli.command {
        match command {
            ConfigCommand::Init => config::init_config(&layout.config())?,
        }
        return Ok(());
    }

    let host = Host::open(layout)?;
    match cli.command {
        Command::Run => commands::run(&host).await?,
        Command::Tick => commands::tick(&host).await?,
        Command::Snooze {
            task,
            reminder,
            minutes,
        } => commands::snooze(&host, &task, &reminder, minutes)?,
        Command::Reset { task } => commands::reset(&host, &task)?,
        Command::Archive { command } => commands::archive(&host, command).await?,
        Command::Regions { command } => commands::regions(&host, command).await?,
        Command::Status => commands::status(&host).await?,
        Command::Config { .. } => {}
    }

    Ok(())
}
