//! CLI module — command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod cron;
pub mod run;
pub mod skills;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "yoctoclaw")]
#[command(version)]
#[command(about = "Event-routing runtime core for a personal AI assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the event loop with a stdin/stdout channel
    Run {
        /// Override the data directory (sessions, journal, cron state)
        #[arg(long)]
        data_dir: Option<std::path::PathBuf>,
    },
    /// Manage skills
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
    /// Inspect scheduled jobs
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum SkillsAction {
    /// List loaded skills and their commands
    List,
}

#[derive(Subcommand)]
pub enum CronAction {
    /// List configured cron entries with their next fire times
    List,
}

/// Entry point for the CLI — called from main().
pub async fn run() -> Result<()> {
    // Load .env before config so env overrides see it.
    dotenvy::dotenv().ok();

    // Initialize logging from config (format, level, optional file output);
    // fall back to defaults if the config file is missing or unreadable.
    let logging_cfg = yoctoclaw::config::Config::load()
        .map(|c| c.logging)
        .unwrap_or_default();
    yoctoclaw::utils::logging::init_logging(&logging_cfg);

    let cli = Cli::parse();

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Run { data_dir }) => {
            run::cmd_run(data_dir).await?;
        }
        Some(Commands::Skills { action }) => {
            skills::cmd_skills(action).await?;
        }
        Some(Commands::Cron { action }) => {
            cron::cmd_cron(action).await?;
        }
        Some(Commands::Version) => {
            cmd_version();
        }
    }

    Ok(())
}

/// Display version information
fn cmd_version() {
    println!("yoctoclaw {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Event-routing runtime core for a personal AI assistant");
}
