//! Shardgate Core - Hash-Sharded PostgreSQL Access with Read Replicas
//!
//! This crate routes every record to one of N PostgreSQL shards by its UUID,
//! sends writes to the shard's single writer and spreads reads over the
//! shard's replicas. Queries that span the whole data set fan out to every
//! shard concurrently and are merged in memory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Consumers (UserRepository, ...)              │
//! └───────────────┬───────────────────────────┬──────────────────┘
//!                 │ get_writer / get_reader   │ scatter_gather
//! ┌───────────────┴───────────────────────────┴──────────────────┐
//! │                        ShardManager                          │
//! │   ┌──────────┐   ┌────────────────────────────────────────┐  │
//! │   │  Router  │   │             ShardRegistry              │  │
//! │   │ uuid → i │   │  shard 0: writer, [reader, reader, …]  │  │
//! │   └──────────┘   │  shard 1: writer, [reader, …]          │  │
//! │                  └────────────────────────────────────────┘  │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ ConnectionPool (async trait)
//!                    ┌───────────┴────────────┐
//!                    │ PgConnectionPool (sqlx)│  ScriptedPool (tests)
//!                    └────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use shardgate_core::{load_config, PgPoolFactory, ShardManager, UserRepository};
//!
//! let manager = Arc::new(ShardManager::new(load_config()?, Arc::new(PgPoolFactory::new())));
//! manager.initialize()?;
//!
//! let users = UserRepository::new(manager.clone());
//! let everyone = users.list_all().await?;
//!
//! manager.close_all().await?;
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: Layered configuration (defaults, TOML file, environment)
//! - [`error`]: The [`ShardError`] taxonomy
//! - [`pool`]: Connection pool contract, PostgreSQL and scripted adapters
//! - [`router`]: UUID to shard index mapping
//! - [`registry`]: Per-shard writer and reader pools
//! - [`manager`]: Lifecycle, routing and pool hand-out
//! - [`scatter`]: Concurrent fan-out with descending merge
//! - [`users`]: User CRUD on top of the manager

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod router;
pub mod scatter;
pub mod users;

// Error exports
pub use error::{CloseFailure, Result, ShardError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with, ConfigError,
    ConfigSource, DatabaseDefaults, PoolSettings, ShardConfig, ShardingConfig, ShardingToml,
};

// Pool exports
#[cfg(feature = "postgres")]
pub use pool::postgres::{PgConnectionPool, PgPoolFactory};
pub use pool::scripted::{ScriptedPool, ScriptedPoolFactory};
pub use pool::{
    ConnectionPool, Endpoint, PoolError, PoolFactory, PoolRole, QueryResult, Record, SqlType,
    SqlValue,
};

// Routing and lifecycle exports
pub use manager::{LifecycleState, ShardHandle, ShardManager};
pub use registry::{Shard, ShardRegistry};
pub use router::{parse_identifier, shard_index};
pub use scatter::{by_column, merge_descending};

// User exports
pub use users::{CreateUser, RepositoryError, UpdateUser, User, UserRepository};
