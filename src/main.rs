//! Clawdeck - session bridge and orchestration core for Claude Code
//!
//! The `serve` subcommand runs the bridge protocol over stdio; the desktop
//! shell spawns it as a child process. `doctor` and `config` are operator
//! conveniences.

use anyhow::Result;
use clap::{Parser, Subcommand};
use clawdeck::bridge::{run_doctor, Bridge};
use clawdeck::ClawdeckConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clawdeck")]
#[command(version)]
#[command(about = "Session bridge for multiplexing Claude Code conversations")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CLAWDECK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the bridge protocol on stdin/stdout
    Serve {
        /// Claude Code CLI binary override
        #[arg(long)]
        claude_bin: Option<String>,

        /// Milliseconds before a pending tool approval auto-denies
        #[arg(long)]
        permission_timeout_ms: Option<u64>,
    },

    /// Check the Claude Code CLI and Node.js installation
    Doctor {
        /// Claude Code CLI binary override
        #[arg(long)]
        claude_bin: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Show the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout is the protocol channel; diagnostics go to stderr
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clawdeck={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match cli.config {
        Some(path) => ClawdeckConfig::load(&path)?,
        None => ClawdeckConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            claude_bin,
            permission_timeout_ms,
        } => {
            let mut config = config;
            if claude_bin.is_some() {
                config.bridge.claude_bin = claude_bin;
            }
            if let Some(timeout) = permission_timeout_ms {
                config.bridge.permission_timeout_ms = timeout;
            }
            Bridge::new(config).run().await?;
        }
        Commands::Doctor { claude_bin } => {
            let resolved = claude_bin
                .filter(|v| !v.trim().is_empty())
                .or_else(|| config.bridge.claude_bin.clone());
            let report = run_doctor(resolved.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config { default } => {
            let shown = if default {
                ClawdeckConfig::default()
            } else {
                config
            };
            println!("{}", toml::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}
