//! kilnd — the Kiln dispatch coordinator.
//!
//! Single binary that assembles the Kiln subsystems:
//! - Audit store (redb)
//! - Node registry
//! - Health monitor
//! - Dispatcher
//! - REST API
//!
//! # Usage
//!
//! ```text
//! kilnd run --config kiln.toml --port 8480 --data-dir /var/lib/kiln
//! kilnd check-config --config kiln.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use kiln_core::KilnConfig;

#[derive(Parser)]
#[command(name = "kilnd", about = "Kiln dispatch coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator.
    Run {
        /// Path to kiln.toml.
        #[arg(long, default_value = "kiln.toml")]
        config: PathBuf,

        /// Port for the REST API.
        #[arg(long, default_value = "8480")]
        port: u16,

        /// Data directory for the audit store.
        #[arg(long, default_value = "/var/lib/kiln")]
        data_dir: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Parse and validate a config file, then print its node table.
    CheckConfig {
        #[arg(long, default_value = "kiln.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kiln=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            daemon::run(config, port, data_dir).await
        }
        Command::CheckConfig { config } => check_config(config),
    }
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = KilnConfig::from_file(&path)?;
    println!(
        "{}: ok (strategy {}, max_retries {}, failover {})",
        path.display(),
        config.balancer.strategy,
        config.balancer.max_retries,
        config.balancer.failover
    );
    if config.nodes.is_empty() {
        println!("no nodes configured");
        return Ok(());
    }

    println!(
        "{:<16} {:<24} {:>5}  {}",
        "NODE", "ADDRESS", "SLOTS", "CAPABILITIES"
    );
    for node in &config.nodes {
        let capabilities: Vec<&str> = node.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<16} {:<24} {:>5}  {}",
            node.id,
            node.address(),
            node.max_concurrent,
            capabilities.join(",")
        );
    }
    Ok(())
}
