//! TTLKV CLI
//!
//! Command-line access to a TTLKV store:
//! - Put, get and delete documents
//! - Run filter queries
//! - Expire, purge and inspect the store
//! - Generate a default config file

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ttlkv::config::{generate_default_config, Config, LoggingConfig};
use ttlkv::{Engine, PutOptions};

#[derive(Parser)]
#[command(name = "ttlkv")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Embedded TTL document store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Backing file, overriding the config
    #[arg(short, long, global = true, conflicts_with = "memory")]
    pub data: Option<PathBuf>,

    /// Use an in-memory store
    #[arg(long, global = true)]
    pub memory: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a JSON document and print its key
    Put {
        /// Document, e.g. '{"temp": 21.5}'
        document: String,
        /// Seconds to live (0 = forever)
        #[arg(short, long, default_value = "0")]
        ttl: u64,
        /// Tags stored under `_tags`
        #[arg(short = 'T', long = "tag")]
        tags: Vec<String>,
        /// Explicit key instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },

    /// Print a document by key
    Get { key: String },

    /// Delete a document by key
    Delete { key: String },

    /// Run a filter query, e.g. '{"temp": {"$gt": 20}, "$limit": 5}'
    Query {
        #[arg(default_value = "{}")]
        filter: String,
    },

    /// Delete expired documents
    Cleanup,

    /// Delete every document
    Purge,

    /// Show store statistics
    Stats,

    /// Generate default config file
    InitConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ttlkv={}", logging.level)));

    // Logs go to stderr so stdout stays machine-readable
    if logging.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn parse_json(input: &str, what: &str) -> anyhow::Result<Value> {
    serde_json::from_str(input).with_context(|| format!("Invalid JSON {}: {}", what, input))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("Failed to write {:?}", path))?;
                eprintln!("Config written to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if cli.memory {
        config.engine.path = None;
    } else if let Some(data) = cli.data {
        config.engine.path = Some(data);
    }

    init_logging(&config.logging);
    tracing::debug!("TTLKV v{}", env!("CARGO_PKG_VERSION"));

    let engine = Engine::open(config.engine).await?;
    let outcome = run(&engine, cli.command).await;
    engine.close().await?;
    outcome
}

async fn run(engine: &Engine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Put {
            document,
            ttl,
            tags,
            id,
        } => {
            let document = parse_json(&document, "document")?;
            let mut options = PutOptions::new().ttl(ttl);
            if !tags.is_empty() {
                options = options.tags(tags);
            }
            if let Some(id) = id {
                options = options.id(id);
            }
            println!("{}", engine.put(document, options).await?);
        }

        Commands::Get { key } => match engine.get(&key).await? {
            Some(document) => print_json(&document)?,
            None => bail!("Key not found: {}", key),
        },

        Commands::Delete { key } => {
            let removed = engine.delete(&key).await?;
            print_json(&serde_json::json!({ "deleted": removed }))?;
        }

        Commands::Query { filter } => {
            let filter = parse_json(&filter, "filter")?;
            print_json(&engine.query(filter).await?)?;
        }

        Commands::Cleanup => {
            let removed = engine.cleanup().await?;
            print_json(&serde_json::json!({ "expired": removed }))?;
        }

        Commands::Purge => {
            let removed = engine.purge().await?;
            print_json(&serde_json::json!({ "purged": removed }))?;
        }

        Commands::Stats => {
            let stats = engine.stats().await?;
            tracing::info!("{}", stats);
            print_json(&stats)?;
        }

        Commands::InitConfig { .. } => {}
    }

    Ok(())
}
