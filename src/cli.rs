//! Command-line interface parsing for the listingsync demo binary
//!
//! This module handles parsing of CLI arguments using clap, including the
//! repeated `-p key=value` query parameters.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, CoordinatorConfig};
use crate::key::QueryKey;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// A query parameter was not in `key=value` form
    #[error("Invalid parameter: '{0}'. Expected key=value")]
    InvalidParam(String),

    /// Loading the config file failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// listingsync - Run listing queries through the coalescing cache
#[derive(Parser, Debug)]
#[command(name = "listingsync")]
#[command(about = "Coalesced, cached queries and live views over a listing data store")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the XDG config location)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the cache TTL in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub ttl_secs: Option<u64>,

    /// Base URL of a remote document service; the built-in sample store is
    /// used when omitted
    #[arg(long, global = true, value_name = "URL")]
    pub source: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve a query, optionally from several concurrent callers
    ///
    /// Examples:
    ///   listingsync query listings -p type=condo
    ///   listingsync query agents -p office=downtown --concurrency 10
    Query {
        /// Collection to query (e.g., listings, agents)
        resource: String,

        /// Equality filter, repeatable. Values that parse as JSON are used as
        /// JSON (`beds=2`), anything else as a string
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_param_arg)]
        params: Vec<(String, Value)>,

        /// Number of concurrent callers issuing the same query
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Simulated latency of the sample store in milliseconds
        #[arg(long, default_value_t = 100)]
        latency_ms: u64,
    },

    /// Subscribe to a query and print result snapshots as they arrive
    Watch {
        /// Collection to watch
        resource: String,

        /// Equality filter, repeatable
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_param_arg)]
        params: Vec<(String, Value)>,

        /// Stop after this many snapshots
        #[arg(long, default_value_t = 1)]
        updates: usize,
    },
}

/// Parses a `key=value` argument into a query parameter.
///
/// # Returns
/// * `Ok((key, value))` where value is JSON if it parses as JSON, else a string
/// * `Err(CliError::InvalidParam)` if there is no `=` or the key is empty
pub fn parse_param_arg(s: &str) -> Result<(String, Value), CliError> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| CliError::InvalidParam(s.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::InvalidParam(s.to_string()));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

impl Cli {
    /// Builds the coordinator configuration from the config file and flags
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => CoordinatorConfig::from_file(path)?,
            None => CoordinatorConfig::load()?,
        };
        if let Some(ttl) = self.ttl_secs {
            config = config.with_ttl(Duration::from_secs(ttl));
        }
        Ok(config)
    }
}

impl Command {
    /// Returns the query key described by the subcommand
    pub fn query_key(&self) -> QueryKey {
        let (resource, params) = match self {
            Command::Query {
                resource, params, ..
            }
            | Command::Watch {
                resource, params, ..
            } => (resource, params),
        };
        QueryKey::from_params(resource.clone(), params.iter().cloned())
    }
}
