//! Helios Persistor command-line tool.
//!
//! Opens a SQLite database described by a schema document and runs one
//! command against it.

mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use helios_persistor::backends::sqlite::{SqliteBackend, SqliteBackendConfig};
use helios_persistor::schema::SchemaRegistry;
use helios_persistor::{FetchRequest, FetchSpec, Pagination, Persistor, SortSpec};
use serde_json::Value;
use tracing::info;

use config::{CliConfig, Command};

/// Initializes the tracing subscriber for logging.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("helios_persistor={},helios_persistor_cli={}", level, level))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn parse_json(label: &str, text: &str) -> anyhow::Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid {} JSON: {}", label, text))
}

fn parse_sort(text: Option<&str>) -> anyhow::Result<SortSpec> {
    match text {
        Some(text) => Ok(SortSpec::parse(&parse_json("sort", text)?)?),
        None => Ok(SortSpec::default()),
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Loads the schema and opens the database.
fn create_persistor(config: &CliConfig) -> anyhow::Result<Persistor> {
    let document = std::fs::read_to_string(&config.schema)
        .with_context(|| format!("Failed to read schema {}", config.schema.display()))?;
    let registry = SchemaRegistry::from_json_str(&document)?;

    info!(database = %config.database, "Initializing SQLite backend");
    let backend = SqliteBackend::with_config(&config.database, SqliteBackendConfig::default())?;

    Ok(Persistor::new(
        Arc::new(registry),
        Arc::new(backend),
        config.persistor_config(),
    )?)
}

async fn run(persistor: &Persistor, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init => {
            persistor.synchronize().await?;
            info!(templates = persistor.registered_templates().len(), "Storage synchronized");
        }
        Command::Templates => {
            for template in persistor.registered_templates() {
                println!("{}\t{}", template, persistor.table_name(template)?);
            }
        }
        Command::Count { template, filter } => {
            let count = persistor
                .count(&template, &parse_json("filter", &filter)?)
                .await?;
            println!("{}", count);
        }
        Command::Fetch {
            template,
            filter,
            fetch,
            sort,
            offset,
            limit,
        } => {
            let mut request = FetchRequest::new(template)
                .filter(parse_json("filter", &filter)?)
                .fetch(FetchSpec::parse(&parse_json("fetch", &fetch)?)?)
                .sort(parse_sort(sort.as_deref())?);
            if let Some(offset) = offset {
                request = request.offset(offset);
            }
            if let Some(limit) = limit {
                request = request.limit(limit);
            }

            let mut graph = persistor.graph();
            let found = persistor.fetch(&mut graph, &request).await?;
            let rendered = found
                .iter()
                .map(|id| graph.to_json(*id))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&Value::Array(rendered))?;
        }
        Command::Query {
            template,
            filter,
            sort,
            offset,
            limit,
        } => {
            let rows = persistor
                .fetch_raw(
                    &template,
                    &parse_json("filter", &filter)?,
                    &parse_sort(sort.as_deref())?,
                    Pagination::new(offset, limit),
                )
                .await?;
            print_json(&Value::Array(rows.into_iter().map(Value::Object).collect()))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CliConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    let persistor = create_persistor(&config)?;
    run(&persistor, config.command.clone()).await
}
