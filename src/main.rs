use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ananya::config::{data_dir, Config};
use ananya::content::{generate_adaptation, readability};
use ananya::daemon;
use ananya::{AdaptationAction, AdaptationDecision, AuditLogger};

/// Ananya - bias-aware academic support core
/// Privacy-preserving interaction analysis and aggregation service
#[derive(Parser)]
#[command(name = "ananya")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Privacy-preserving interaction analysis and aggregation", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, default config and audit database
    Init,

    /// Run the analysis service in the foreground
    Serve,

    /// Show whether the service is running
    Status,

    /// Stop a running service
    Stop,

    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Report readability metrics for a lesson file
    AnalyzeContent {
        /// Path to the lesson text
        file: String,
    },

    /// Print a simplified version of a lesson file
    Simplify {
        /// Path to the lesson text
        file: String,
        /// Simplification level (1-3)
        #[arg(long, default_value = "2", value_parser = clap::value_parser!(u8).range(1..=3))]
        level: u8,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Replay archived inputs and compare with the recorded decisions
    Verify {
        #[arg(long)]
        fingerprint: String,
        #[arg(long)]
        inputs_hash: String,
    },

    /// Walk the hash chain for edits or deletions
    CheckChain,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Keep stdout for command output
        .init();

    let dir = data_dir()?;

    match cli.command {
        Commands::Init => {
            info!("Initializing Ananya");
            ananya::init(&dir)?;
        }
        Commands::Serve => {
            if daemon::is_running(&dir) {
                anyhow::bail!("Service is already running");
            }
            ananya::init(&dir)?;
            let config = Config::load(&dir.join("config.toml")).context("Failed to load config")?;
            daemon::start_daemon(&dir, config).await?;
        }
        Commands::Status => {
            println!("{}", daemon::daemon_status(&dir));
        }
        Commands::Stop => {
            daemon::stop_daemon(&dir)?;
            println!("Service stopped");
        }
        Commands::Audit { action } => {
            let audit = AuditLogger::open(&dir.join(daemon::AUDIT_DB)).context("Failed to open audit database")?;
            match action {
                AuditAction::Verify {
                    fingerprint,
                    inputs_hash,
                } => {
                    if audit.verify(&fingerprint, &inputs_hash)? {
                        println!("Verified: recorded decisions match the replay");
                    } else {
                        println!("Mismatch: no matching record, or the replay differs");
                        std::process::exit(1);
                    }
                }
                AuditAction::CheckChain => {
                    let chain = audit.verify_chain()?;
                    match chain.broken_at {
                        None => println!("Chain intact ({} records)", chain.records),
                        Some(id) => {
                            println!("Chain broken at record {} ({} records checked)", id, chain.records);
                            std::process::exit(1);
                        }
                    }
                }
            }
        }
        Commands::AnalyzeContent { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file))?;
            let report = readability::analyze(&text);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Simplify { file, level } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("Failed to read {}", file))?;
            let decision = AdaptationDecision {
                action: AdaptationAction::Simplify,
                magnitude: level,
            };
            let adapted = generate_adaptation(&decision, &text);
            println!("{}", adapted.content);
            info!(
                "Grade {:.1} -> {:.1}; {}",
                adapted.grade_before,
                adapted.grade_after,
                adapted.changes_made.join(", ")
            );
        }
    }

    Ok(())
}
