//! WolfHA - High-Availability MariaDB/MySQL Client
//!
//! Command line front end: writes and validates configuration, and runs
//! statements through a failover connection.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfha::config::{FailoverConfig, SAMPLE_CONFIG};
use wolfha::driver::Driver;
use wolfha::protocol::{is_read_statement, QueryResult};

/// WolfHA - High-Availability MariaDB/MySQL Client
#[derive(Parser)]
#[command(name = "wolfha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfha.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfha.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Connect and show the elected hosts
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one statement through a failover connection
    Query {
        /// SQL statement
        sql: String,

        /// Route the statement to a replica
        #[arg(long)]
        read_only: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty", None)?;
            run_init(output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty", None)?;
            run_validate(cli.config)
        }
        Commands::Status { json } => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_status(config, json).await
        }
        Commands::Query { sql, read_only } => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_query(config, sql, read_only).await
        }
    }
}

/// Initialize logging, to `file` when given and stderr otherwise
fn init_logging(level: &str, format: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let writer = match file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            BoxMakeWriter::new(Mutex::new(log_file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(file.is_none())
                    .with_writer(writer),
            )
            .init();
    }
    Ok(())
}

/// Load configuration and install logging from it
fn load_config(path: &Path, level_override: Option<&str>) -> anyhow::Result<FailoverConfig> {
    let config = FailoverConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;
    init_logging(
        level_override.unwrap_or(&config.logging.level),
        &config.logging.format,
        config.logging.file.as_deref(),
    )?;
    Ok(config)
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{:?} already exists, refusing to overwrite", output);
    }
    std::fs::write(&output, SAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {:?}", output))?;
    println!("Configuration written to {:?}", output);
    println!("Edit the host list and credentials, then run `wolfha validate`.");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match FailoverConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Topology:       {}", config.topology);
            for host in config.host_addresses()? {
                match host.host_type {
                    Some(t) => println!("  Host:           {} ({:?})", host, t),
                    None => println!("  Host:           {}", host),
                }
            }
            println!("  Retries:        {} passes", config.failover.retries_all_down);
            println!("  Blacklist:      {} ms", config.failover.blacklist_timeout_ms);
            println!("  Connect:        {} ms", config.failover.connect_timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Connect and print the elected hosts
async fn run_status(config: FailoverConfig, json: bool) -> anyhow::Result<()> {
    let driver = Driver::new(config)?;
    let conn = driver.connect().await.context("No usable host found")?;
    let status = conn.status().await;
    conn.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("WolfHA Connection Status");
    println!("========================");
    println!();
    println!("Topology:         {}", status.topology);
    println!("Master:           {}", status.master.as_deref().unwrap_or("(unavailable)"));
    println!("Replica:          {}", status.secondary.as_deref().unwrap_or("(none)"));
    if !status.blacklist.is_empty() {
        println!();
        println!("Blacklisted hosts:");
        for entry in &status.blacklist {
            println!("  {}  since {}", entry.host, entry.failed_at.to_rfc3339());
        }
    }
    Ok(())
}

/// Run one statement and print its rows
async fn run_query(config: FailoverConfig, sql: String, read_only: bool) -> anyhow::Result<()> {
    let driver = Driver::new(config)?;
    let conn = driver.connect().await.context("No usable host found")?;
    if read_only {
        conn.set_read_only(true).await?;
    }

    let result = if is_read_statement(&sql) {
        conn.query(&sql).await
    } else {
        conn.execute(&sql).await
    };
    conn.close().await;

    print_result(&result?);
    Ok(())
}

fn print_result(result: &QueryResult) {
    if result.columns.is_empty() {
        println!(
            "OK, {} row(s) affected, last insert id {}",
            result.affected_rows, result.last_insert_id
        );
        return;
    }

    println!("{}", result.columns.join("\t"));
    for row in &result.rows {
        let line: Vec<&str> = row.iter().map(|v| v.as_deref().unwrap_or("NULL")).collect();
        println!("{}", line.join("\t"));
    }
    println!("({} row(s))", result.rows.len());
}
