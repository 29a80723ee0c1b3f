use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::fetcher::{SourceSection, DEFAULT_SOURCES};

const DEFAULT_SOURCE_URL: &str = "http://ras.phys.msu.ru/table";
const MAX_CONCURRENCY: usize = 64;

#[derive(Parser, Debug, Clone)]
#[command(name = "timetable")]
#[command(about = "Timetable importer - loads faculty schedule pages and serves them as a JSON API")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a single import and exit
    Import {
        #[command(flatten)]
        config: Config,
    },
    /// Serve the timetable API
    Serve {
        #[command(flatten)]
        config: Config,

        /// Run an import in the background right after startup
        #[arg(long, env = "TIMETABLE_IMPORT_ON_START")]
        import_on_start: bool,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct Config {
    /// Base URL of the schedule pages ({base}/{faculty}/{semester}/{group}.htm)
    #[arg(long, env = "TIMETABLE_SOURCE_URL", default_value = DEFAULT_SOURCE_URL)]
    pub source_url: String,

    /// Sections to fetch, overriding the built-in list
    /// Format: "faculty/semester:groups,...", e.g. "3/1:10,3/2:8"
    #[arg(long, env = "TIMETABLE_SOURCES", value_name = "SOURCES")]
    pub sources: Option<String>,

    /// Maximum number of pages fetched at once
    #[arg(long, env = "TIMETABLE_CONCURRENCY", default_value = "8")]
    pub concurrency: usize,

    /// Per-page request timeout in seconds
    #[arg(long, env = "TIMETABLE_TIMEOUT", default_value = "30", value_name = "SECONDS")]
    pub timeout: u64,

    /// Database file path (for local SQLite, ignored if --database-url is set)
    #[arg(short, long, default_value = "timetable.db")]
    pub db: PathBuf,

    /// Turso/LibSQL database URL (e.g., libsql://your-db.turso.io)
    /// When set, uses remote database instead of local SQLite file
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Turso/LibSQL authentication token (required when using --database-url)
    #[arg(long, env = "DATABASE_AUTH_TOKEN")]
    pub database_auth_token: Option<String>,

    /// Bearer token required by POST /timetable/update; open when unset
    #[arg(long, env = "TIMETABLE_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Web server port (only used in serve mode)
    #[arg(long, env = "TIMETABLE_PORT", default_value = "3000")]
    pub port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Config {
    /// Check if using Turso/remote database
    pub fn uses_turso(&self) -> bool {
        self.database_url.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Configured sections, or the built-in list when none are given
    pub fn source_sections(&self) -> Result<Vec<SourceSection>> {
        match self.sources {
            Some(ref expr) => parse_sources_expr(expr),
            None => Ok(DEFAULT_SOURCES.to_vec()),
        }
    }

    pub fn page_count(&self) -> usize {
        self.source_sections()
            .map(|sections| sections.iter().map(|s| s.groups as usize).sum())
            .unwrap_or(0)
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<()> {
        // Validate source URL
        if !self.source_url.starts_with("http://") && !self.source_url.starts_with("https://") {
            bail!(
                "Invalid source URL '{}': must start with http:// or https://",
                self.source_url
            );
        }

        self.source_sections()?;

        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            bail!(
                "Invalid concurrency {}: must be between 1 and {}",
                self.concurrency,
                MAX_CONCURRENCY
            );
        }

        if self.timeout == 0 {
            bail!("Invalid timeout: --timeout must be at least 1 second");
        }

        // Validate database configuration
        if let Some(ref db_url) = self.database_url {
            // Validate database URL format
            if !db_url.starts_with("libsql://") && !db_url.starts_with("https://") {
                bail!(
                    "Invalid database URL '{}': must start with libsql:// or https://\n\
                     Example: libsql://your-database.turso.io",
                    db_url
                );
            }

            // Require auth token for remote databases
            if self.database_auth_token.is_none() {
                bail!(
                    "Turso database URL requires --database-auth-token to be set.\n\
                     Set it via CLI flag or DATABASE_AUTH_TOKEN environment variable.\n\
                     You can get your token from: turso db tokens create <database-name>"
                );
            }
        }

        if let Some(ref token) = self.admin_token {
            if token.trim().is_empty() {
                bail!(
                    "Admin token is empty.\n\
                     Unset TIMETABLE_ADMIN_TOKEN to leave the update endpoint open, or set a real token."
                );
            }
        }

        Ok(())
    }
}

/// Parse a comma-separated list of `faculty/semester:groups` sections
fn parse_sources_expr(expr: &str) -> Result<Vec<SourceSection>> {
    let sections = expr
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<SourceSection>())
        .collect::<Result<Vec<_>>>()
        .context("Invalid --sources value")?;

    if sections.is_empty() {
        bail!(
            "No sources given in --sources.\n\
             Expected format: \"faculty/semester:groups,...\", e.g. \"3/1:10,3/2:8\""
        );
    }
    Ok(sections)
}
