//! Command-line configuration.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PERSISTOR_DATABASE` | persistor.db | SQLite database file (`:memory:` for a scratch database) |
//! | `PERSISTOR_SCHEMA` | (required) | Schema document (JSON) |
//! | `PERSISTOR_LOG_LEVEL` | info | Log level |
//! | `PERSISTOR_MAX_DEADLOCK_RETRIES` | 3 | Deadlock retry budget |

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use helios_persistor::PersistorConfig;

/// Command-line configuration for the `persistor` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "persistor")]
#[command(about = "Inspect and query a Helios Persistor database")]
pub struct CliConfig {
    /// SQLite database file.
    #[arg(long, env = "PERSISTOR_DATABASE", default_value = "persistor.db")]
    pub database: String,

    /// Schema document describing templates and storage.
    #[arg(long, env = "PERSISTOR_SCHEMA")]
    pub schema: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "PERSISTOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// How many times a deadlocked write phase is retried.
    #[arg(long, env = "PERSISTOR_MAX_DEADLOCK_RETRIES", default_value = "3")]
    pub max_deadlock_retries: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create missing tables and columns for every template.
    Init,

    /// List templates with their tables.
    Templates,

    /// Count rows of a template matching a filter.
    Count {
        template: String,
        /// Filter expression, e.g. '{"amount": {"$lt": 500}}'.
        #[arg(long, default_value = "{}")]
        filter: String,
    },

    /// Fetch instances, with relationships, as JSON.
    Fetch {
        template: String,
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Fetch specification, e.g. '{"primaryAddresses": true}'.
        #[arg(long, default_value = "{}")]
        fetch: String,
        /// Sort specification, e.g. '{"name": 1}'.
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Print stored rows without instantiating them.
    Query {
        template: String,
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
    },
}

impl CliConfig {
    /// Validates the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.trim().is_empty() {
            errors.push("Database path cannot be empty".to_string());
        }

        if !self.schema.is_file() {
            errors.push(format!("Schema file not found: {}", self.schema.display()));
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.log_level.as_str()) {
            errors.push(format!("Unknown log level: {}", self.log_level));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Engine configuration derived from the command line.
    pub fn persistor_config(&self) -> PersistorConfig {
        PersistorConfig::default().with_max_deadlock_retries(self.max_deadlock_retries)
    }
}
