//! Shard Configuration
//!
//! Builds the fixed, ordered list of [`ShardConfig`] entries the registry is
//! created from, together with pool tuning and the scatter-gather bound.
//!
//! # Configuration Priority
//!
//! Values are layered with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! The file lives at `$XDG_CONFIG_HOME/shardgate/shards.toml` unless a path is
//! given explicitly.
//!
//! # Example Configuration
//!
//! ```toml
//! [database]
//! host = "localhost"
//! port = 5432
//! user = "postgres"
//! password = "postgres"
//! database = "app_db"
//!
//! [pool]
//! max_connections = 10
//! acquire_timeout_ms = 30000
//!
//! [scatter]
//! max_concurrency = 8
//!
//! [[shards]]
//! write_host = "pg-0"
//! read_hosts = ["pg-0-replica-a", "pg-0-replica-b"]
//!
//! [[shards]]
//! write_host = "pg-1"
//! port = 5433
//! ```
//!
//! # Environment Variables
//!
//! - `SHARD_COUNT`: number of shards (at least 1)
//! - `SHARD_<i>_WRITE_HOST`: write host of shard `i` (default `DB_HOST`)
//! - `SHARD_<i>_READ_HOSTS`: comma-separated read hosts (default: the write host)
//! - `SHARD_<i>_PORT`, `SHARD_<i>_PASSWORD`: per-shard overrides of `DB_PORT`/`DB_PASSWORD`
//! - `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`: process-wide defaults
//! - `DB_POOL_MAX_CONNECTIONS`, `DB_POOL_MIN_CONNECTIONS`,
//!   `DB_POOL_ACQUIRE_TIMEOUT_MS`, `DB_POOL_IDLE_TIMEOUT_MS`: pool tuning
//! - `SCATTER_MAX_CONCURRENCY`: bound on concurrent shard queries per scatter-gather

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::Endpoint;

// =============================================================================
// Error Types
// =============================================================================

/// Invalid or unreadable shard configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value could not be parsed
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Setting name
        key: String,
        /// Rejected raw value
        value: String,
    },

    /// The shard list is empty
    #[error("at least one shard must be configured")]
    NoShards,

    /// A shard has no reader pools
    #[error("shard {shard} has no read hosts")]
    NoReadHosts {
        /// Offending shard
        shard: usize,
    },

    /// A shard index outside `[0, count)` was requested
    #[error("shard index {index} is out of range for {count} shard(s)")]
    ShardIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Configured shard count
        count: usize,
    },
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Process-wide connection defaults shared by every shard
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseDefaults {
    /// Host used when a shard does not name its write host
    pub host: String,
    /// Port used when a shard does not override it
    pub port: u16,
    /// Login user for every pool
    pub user: String,
    /// Password used when a shard does not override it
    pub password: String,
    /// Database name on every shard
    pub database: String,
}

impl Default for DatabaseDefaults {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "app_db".to_string(),
        }
    }
}

impl std::fmt::Debug for DatabaseDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseDefaults")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Settings for one shard; its position in the list is its identity
#[derive(Clone, PartialEq, Eq)]
pub struct ShardConfig {
    /// Primary, write-capable host
    pub write_host: String,
    /// Read replicas (may include the write host)
    pub read_hosts: Vec<String>,
    /// Port shared by the writer and readers
    pub port: u16,
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
    /// Database name
    pub database: String,
}

impl ShardConfig {
    /// A shard served by one host for both writes and reads
    #[must_use]
    pub fn single_node(host: impl Into<String>, defaults: &DatabaseDefaults) -> Self {
        let host = host.into();
        Self {
            read_hosts: vec![host.clone()],
            write_host: host,
            port: defaults.port,
            user: defaults.user.clone(),
            password: defaults.password.clone(),
            database: defaults.database.clone(),
        }
    }

    /// Replace the read hosts
    #[must_use]
    pub fn with_read_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Endpoint of the writer pool
    #[must_use]
    pub fn writer_endpoint(&self) -> Endpoint {
        self.endpoint(&self.write_host)
    }

    /// Endpoints of the reader pools, in configured order
    #[must_use]
    pub fn reader_endpoints(&self) -> Vec<Endpoint> {
        self.read_hosts.iter().map(|h| self.endpoint(h)).collect()
    }

    fn endpoint(&self, host: &str) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
        }
    }
}

impl std::fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConfig")
            .field("write_host", &self.write_host)
            .field("read_hosts", &self.read_hosts)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Tuning applied to every pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum open connections per pool
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// How long `execute` waits for a free connection
    pub acquire_timeout_ms: u64,
    /// How long an idle connection is kept
    pub idle_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 10_000,
        }
    }
}

impl PoolSettings {
    /// Acquire timeout as a duration
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Idle timeout as a duration
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Complete sharding configuration
///
/// Use [`load_config`] to load it with proper priority handling. Once handed to
/// a [`ShardManager`](crate::ShardManager) it is never mutated.
#[derive(Clone, Debug)]
pub struct ShardingConfig {
    /// Process-wide defaults
    pub database: DatabaseDefaults,
    /// Ordered shard list
    pub shards: Vec<ShardConfig>,
    /// Pool tuning
    pub pool: PoolSettings,
    /// Bound on concurrent shard queries in one scatter-gather (`None` = all at once)
    pub scatter_max_concurrency: Option<usize>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        let database = DatabaseDefaults::default();
        Self {
            shards: vec![ShardConfig::single_node(database.host.clone(), &database)],
            database,
            pool: PoolSettings::default(),
            scatter_max_concurrency: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ShardingConfig {
    /// Configuration for an explicit shard list
    #[must_use]
    pub fn with_shards(shards: Vec<ShardConfig>) -> Self {
        Self {
            shards,
            ..Self::default()
        }
    }

    /// Number of configured shards
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check the shard topology
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoShards`] for an empty shard list and
    /// [`ConfigError::NoReadHosts`] for the first shard without readers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards.is_empty() {
            return Err(ConfigError::NoShards);
        }
        if let Some(shard) = self.shards.iter().position(|s| s.read_hosts.is_empty()) {
            return Err(ConfigError::NoReadHosts { shard });
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[database]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseToml {
    /// Default host
    pub host: Option<String>,
    /// Default port
    pub port: Option<u16>,
    /// Login user
    pub user: Option<String>,
    /// Default password
    pub password: Option<String>,
    /// Database name
    pub database: Option<String>,
}

/// `[pool]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// Maximum open connections per pool
    pub max_connections: Option<u32>,
    /// Connections kept open while idle
    pub min_connections: Option<u32>,
    /// Acquire timeout in milliseconds
    pub acquire_timeout_ms: Option<u64>,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: Option<u64>,
}

/// `[scatter]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterToml {
    /// Concurrent shard queries per scatter-gather
    pub max_concurrency: Option<usize>,
}

/// One `[[shards]]` entry; unset fields fall back to `[database]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardToml {
    /// Write host
    pub write_host: Option<String>,
    /// Read hosts (omitted = the write host)
    pub read_hosts: Option<Vec<String>>,
    /// Port override
    pub port: Option<u16>,
    /// Password override
    pub password: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingToml {
    /// Process-wide defaults
    pub database: DatabaseToml,
    /// Pool tuning
    pub pool: PoolToml,
    /// Scatter-gather settings
    pub scatter: ScatterToml,
    /// Ordered shard list
    pub shards: Vec<ShardToml>,
}

// =============================================================================
// Configuration Loading
// =============================================================================

const ENV_SHARD_COUNT: &str = "SHARD_COUNT";
const ENV_DB_HOST: &str = "DB_HOST";
const ENV_DB_PORT: &str = "DB_PORT";
const ENV_DB_USER: &str = "DB_USER";
const ENV_DB_PASSWORD: &str = "DB_PASSWORD";
const ENV_DB_NAME: &str = "DB_NAME";
const ENV_POOL_MAX: &str = "DB_POOL_MAX_CONNECTIONS";
const ENV_POOL_MIN: &str = "DB_POOL_MIN_CONNECTIONS";
const ENV_POOL_ACQUIRE: &str = "DB_POOL_ACQUIRE_TIMEOUT_MS";
const ENV_POOL_IDLE: &str = "DB_POOL_IDLE_TIMEOUT_MS";
const ENV_SCATTER_MAX: &str = "SCATTER_MAX_CONCURRENCY";

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/shardgate/shards.toml` or
/// `~/.config/shardgate/shards.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("shardgate").join("shards.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, if an
/// environment value is malformed, or if the resulting topology is invalid.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ShardingConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Same as [`load_config`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ShardingConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Load configuration reading variables through `lookup`
///
/// # Errors
///
/// Same as [`load_config`].
pub fn load_config_with<F>(path: Option<PathBuf>, lookup: F) -> Result<ShardingConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ShardingConfig::default();
    let mut layout = ShardingToml::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
                    path: config_path.clone(),
                    source: e,
                })?;

            layout = toml::from_str(&toml_content)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                shards = layout.shards.len(),
                "Loaded shard configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_toml_config(&mut config, &layout);

    let mut shards = layout.shards;
    apply_env_config(&mut config, &mut shards, &lookup)?;

    if shards.is_empty() {
        shards.push(ShardToml::default());
    }
    config.shards = shards
        .iter()
        .map(|overrides| resolve_shard(&config.database, overrides))
        .collect();

    config.validate()?;
    Ok(config)
}

/// Split a comma-separated host list, dropping blanks
#[must_use]
pub fn parse_read_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect()
}

/// Apply the non-shard TOML sections
fn apply_toml_config(config: &mut ShardingConfig, toml: &ShardingToml) {
    if let Some(ref host) = toml.database.host {
        config.database.host.clone_from(host);
    }
    if let Some(port) = toml.database.port {
        config.database.port = port;
    }
    if let Some(ref user) = toml.database.user {
        config.database.user.clone_from(user);
    }
    if let Some(ref password) = toml.database.password {
        config.database.password.clone_from(password);
    }
    if let Some(ref database) = toml.database.database {
        config.database.database.clone_from(database);
    }

    if let Some(max) = toml.pool.max_connections {
        config.pool.max_connections = max;
    }
    if let Some(min) = toml.pool.min_connections {
        config.pool.min_connections = min;
    }
    if let Some(timeout) = toml.pool.acquire_timeout_ms {
        config.pool.acquire_timeout_ms = timeout;
    }
    if let Some(timeout) = toml.pool.idle_timeout_ms {
        config.pool.idle_timeout_ms = timeout;
    }

    if toml.scatter.max_concurrency.is_some() {
        config.scatter_max_concurrency = toml.scatter.max_concurrency;
    }
}

/// Apply environment overrides, resizing the shard list if `SHARD_COUNT` is set
fn apply_env_config<F>(
    config: &mut ShardingConfig,
    shards: &mut Vec<ShardToml>,
    lookup: &F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut from_env = false;

    if let Some(host) = lookup(ENV_DB_HOST) {
        config.database.host = host;
        from_env = true;
    }
    if let Some(port) = parse_env::<u16, _>(lookup, ENV_DB_PORT)? {
        config.database.port = port;
        from_env = true;
    }
    if let Some(user) = lookup(ENV_DB_USER) {
        config.database.user = user;
        from_env = true;
    }
    if let Some(password) = lookup(ENV_DB_PASSWORD) {
        config.database.password = password;
        from_env = true;
    }
    if let Some(database) = lookup(ENV_DB_NAME) {
        config.database.database = database;
        from_env = true;
    }

    if let Some(max) = parse_env(lookup, ENV_POOL_MAX)? {
        config.pool.max_connections = max;
        from_env = true;
    }
    if let Some(min) = parse_env(lookup, ENV_POOL_MIN)? {
        config.pool.min_connections = min;
        from_env = true;
    }
    if let Some(timeout) = parse_env(lookup, ENV_POOL_ACQUIRE)? {
        config.pool.acquire_timeout_ms = timeout;
        from_env = true;
    }
    if let Some(timeout) = parse_env(lookup, ENV_POOL_IDLE)? {
        config.pool.idle_timeout_ms = timeout;
        from_env = true;
    }
    if let Some(max) = parse_env::<usize, _>(lookup, ENV_SCATTER_MAX)? {
        config.scatter_max_concurrency = Some(max);
        from_env = true;
    }

    if let Some(count) = parse_env::<usize, _>(lookup, ENV_SHARD_COUNT)? {
        if count == 0 {
            return Err(ConfigError::NoShards);
        }
        shards.resize_with(count, ShardToml::default);
        from_env = true;
    }

    for (i, shard) in shards.iter_mut().enumerate() {
        if let Some(host) = lookup(&format!("SHARD_{i}_WRITE_HOST")) {
            shard.write_host = Some(host);
            from_env = true;
        }
        if let Some(raw) = lookup(&format!("SHARD_{i}_READ_HOSTS")) {
            let hosts = parse_read_hosts(&raw);
            shard.read_hosts = if hosts.is_empty() { None } else { Some(hosts) };
            from_env = true;
        }
        if let Some(port) = parse_env(lookup, &format!("SHARD_{i}_PORT"))? {
            shard.port = Some(port);
            from_env = true;
        }
        if let Some(password) = lookup(&format!("SHARD_{i}_PASSWORD")) {
            shard.password = Some(password);
            from_env = true;
        }
    }

    if from_env {
        config.source = ConfigSource::Env;
    }
    Ok(())
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

fn resolve_shard(defaults: &DatabaseDefaults, overrides: &ShardToml) -> ShardConfig {
    let write_host = overrides
        .write_host
        .clone()
        .unwrap_or_else(|| defaults.host.clone());
    let read_hosts = overrides
        .read_hosts
        .clone()
        .unwrap_or_else(|| vec![write_host.clone()]);

    ShardConfig {
        write_host,
        read_hosts,
        port: overrides.port.unwrap_or(defaults.port),
        user: defaults.user.clone(),
        password: overrides
            .password
            .clone()
            .unwrap_or_else(|| defaults.password.clone()),
        database: defaults.database.clone(),
    }
}
