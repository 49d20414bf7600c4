//! Error Types
//!
//! One closed error type for everything the shard layer can report. Each
//! variant carries the shard index and pool role it concerns, so a caller can
//! diagnose a failure without re-deriving the routing decision.

use thiserror::Error;

use crate::config::ConfigError;
use crate::pool::{PoolError, PoolRole};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ShardError>;

// =============================================================================
// Shard Errors
// =============================================================================

/// Errors surfaced by the shard manager and its handles
#[derive(Debug, Error)]
pub enum ShardError {
    /// Routing or pool access before `initialize` or after `close_all`
    #[error("shard manager is not initialized")]
    NotInitialized,

    /// Invalid shard topology or an out-of-range shard index
    #[error("shard configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A pool failed while executing a statement
    #[error("{role} pool on shard {shard} failed: {source}")]
    Pool {
        /// Shard the pool belongs to
        shard: usize,
        /// Which pool of the shard
        role: PoolRole,
        /// Underlying pool failure
        #[source]
        source: PoolError,
    },

    /// One shard failed during scatter-gather; no rows are returned
    #[error("scatter-gather aborted, {role} pool on shard {shard} failed: {source}")]
    Aggregate {
        /// Shard whose query failed
        shard: usize,
        /// Which pool of the shard served the query
        role: PoolRole,
        /// Underlying pool failure
        #[source]
        source: PoolError,
    },

    /// One or more pools failed to close during `close_all`
    #[error("{} pool(s) failed to close", failures.len())]
    Close {
        /// Every failed close, in shard order
        failures: Vec<CloseFailure>,
    },

    /// A textual identifier could not be parsed
    #[error("invalid record identifier {0:?}")]
    InvalidIdentifier(String),
}

impl ShardError {
    /// Shard index this error concerns, if any
    #[must_use]
    pub fn shard(&self) -> Option<usize> {
        match self {
            Self::Pool { shard, .. } | Self::Aggregate { shard, .. } => Some(*shard),
            Self::Configuration(ConfigError::NoReadHosts { shard }) => Some(*shard),
            Self::Configuration(ConfigError::ShardIndexOutOfRange { index, .. }) => Some(*index),
            _ => None,
        }
    }

    /// Whether retrying the same call later could succeed
    ///
    /// Only upstream pool failures are transient; lifecycle and configuration
    /// errors need caller action first.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Pool { source, .. } | Self::Aggregate { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// A pool that failed to close
#[derive(Debug, Clone)]
pub struct CloseFailure {
    /// Shard the pool belonged to
    pub shard: usize,
    /// Which pool of the shard
    pub role: PoolRole,
    /// Why the close failed
    pub error: PoolError,
}

impl std::fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} pool on shard {}: {}", self.role, self.shard, self.error)
    }
}
