//! Shard Manager
//!
//! Composition root of the shard layer: owns the configuration, the pool
//! factory and the [`ShardRegistry`], and hands out per-shard pool handles.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --initialize--> Initialized --close_all--> Closed
//!                                    ^                        |
//!                                    +-------initialize-------+
//! ```
//!
//! Every routing and pool-access call fails with
//! [`ShardError::NotInitialized`] outside `Initialized`. `shard_count` is a
//! plain read of the configuration and works in every state; after
//! `close_all` it keeps reporting the configured count.
//!
//! # Concurrency
//!
//! The registry is only replaced wholesale, by `initialize` and `close_all`.
//! Lookups take a short read lock to clone the registry `Arc` and never hold
//! it across an await.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ShardingConfig};
use crate::error::{CloseFailure, Result, ShardError};
use crate::pool::{ConnectionPool, PoolFactory, PoolRole, QueryResult, SqlValue};
use crate::registry::ShardRegistry;
use crate::router::shard_index;

// ============================================================================
// Lifecycle State
// ============================================================================

/// Externally visible lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, `initialize` not yet called
    Uninitialized,
    /// Pools exist and can be handed out
    Initialized,
    /// `close_all` ran; `initialize` may be called again
    Closed,
}

enum ManagerState {
    Uninitialized,
    Initialized(Arc<ShardRegistry>),
    Closed,
}

impl ManagerState {
    fn lifecycle(&self) -> LifecycleState {
        match self {
            Self::Uninitialized => LifecycleState::Uninitialized,
            Self::Initialized(_) => LifecycleState::Initialized,
            Self::Closed => LifecycleState::Closed,
        }
    }
}

// ============================================================================
// Shard Handle
// ============================================================================

/// A pool handed out by the manager, tagged with its shard and role
#[derive(Clone)]
pub struct ShardHandle {
    shard: usize,
    role: PoolRole,
    pool: Arc<dyn ConnectionPool>,
}

impl ShardHandle {
    /// Shard the pool belongs to
    #[must_use]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Writer or which reader
    #[must_use]
    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// Address of the pool
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.pool.endpoint()
    }

    /// The raw pool
    #[must_use]
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Execute a statement on this pool
    ///
    /// # Errors
    ///
    /// [`ShardError::Pool`] with this handle's shard and role when the pool
    /// fails; the pool error itself is passed through unchanged.
    pub async fn execute(&self, statement: &str, params: &[SqlValue]) -> Result<QueryResult> {
        debug!(shard = self.shard, role = %self.role, "Executing statement");
        self.pool
            .execute(statement, params)
            .await
            .map_err(|source| ShardError::Pool {
                shard: self.shard,
                role: self.role,
                source,
            })
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("shard", &self.shard)
            .field("role", &self.role)
            .field("endpoint", &self.pool.endpoint())
            .finish()
    }
}

// ============================================================================
// Shard Manager
// ============================================================================

/// Owns every shard pool and routes record identifiers to them
pub struct ShardManager {
    pub(crate) config: Arc<ShardingConfig>,
    factory: Arc<dyn PoolFactory>,
    state: RwLock<ManagerState>,
}

impl ShardManager {
    /// Create a manager; no pools exist until [`initialize`](Self::initialize)
    #[must_use]
    pub fn new(config: ShardingConfig, factory: Arc<dyn PoolFactory>) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            state: RwLock::new(ManagerState::Uninitialized),
        }
    }

    /// The configuration this manager was built with
    #[must_use]
    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    /// Current lifecycle state
    #[must_use]
    pub fn lifecycle(&self) -> LifecycleState {
        self.state.read().lifecycle()
    }

    /// Whether pools can currently be handed out
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lifecycle() == LifecycleState::Initialized
    }

    /// Number of configured shards, valid in every lifecycle state
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.config.shard_count()
    }

    /// Build one writer pool and one pool per read host for every shard
    ///
    /// Idempotent: a second call while initialized does nothing. Pool
    /// creation does not connect, so this never blocks; pool factories that
    /// spawn maintenance tasks (such as the PostgreSQL one) need to run
    /// inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ShardError::Configuration`] for an empty shard list or a shard
    /// without read hosts, [`ShardError::Pool`] if a pool cannot be created.
    /// The manager stays in its previous state on error.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.write();
        if let ManagerState::Initialized(_) = *state {
            debug!("Shard manager already initialized");
            return Ok(());
        }

        let registry = ShardRegistry::build(&self.config, self.factory.as_ref())?;
        for shard in registry.iter() {
            info!(
                shard = shard.index(),
                readers = shard.readers().len(),
                writer = %shard.writer().endpoint(),
                "Shard initialized"
            );
        }
        info!(
            shards = registry.len(),
            pools = registry.pool_count(),
            "Shard manager initialized"
        );

        *state = ManagerState::Initialized(Arc::new(registry));
        Ok(())
    }

    /// Shard owning `id`
    ///
    /// # Errors
    ///
    /// [`ShardError::NotInitialized`] outside the initialized state.
    pub fn shard_for(&self, id: &Uuid) -> Result<usize> {
        let registry = self.registry()?;
        Ok(route(&registry, id))
    }

    /// Writer pool of the shard owning `id`
    ///
    /// # Errors
    ///
    /// [`ShardError::NotInitialized`] outside the initialized state.
    pub fn get_writer(&self, id: &Uuid) -> Result<ShardHandle> {
        let registry = self.registry()?;
        let index = route(&registry, id);
        debug!(id = %id, shard = index, "Routed write");
        writer_of(&registry, index)
    }

    /// A uniformly random reader pool of the shard owning `id`
    ///
    /// # Errors
    ///
    /// [`ShardError::NotInitialized`] outside the initialized state.
    pub fn get_reader(&self, id: &Uuid) -> Result<ShardHandle> {
        let registry = self.registry()?;
        let index = route(&registry, id);
        debug!(id = %id, shard = index, "Routed read");
        reader_of(&registry, index)
    }

    /// Writer pool of shard `index`
    ///
    /// # Errors
    ///
    /// [`ShardError::NotInitialized`] outside the initialized state,
    /// [`ConfigError::ShardIndexOutOfRange`] for an unknown index.
    pub fn get_writer_by_index(&self, index: usize) -> Result<ShardHandle> {
        let registry = self.registry()?;
        writer_of(&registry, index)
    }

    /// A uniformly random reader pool of shard `index`
    ///
    /// # Errors
    ///
    /// Same as [`get_writer_by_index`](Self::get_writer_by_index).
    pub fn get_reader_by_index(&self, index: usize) -> Result<ShardHandle> {
        let registry = self.registry()?;
        reader_of(&registry, index)
    }

    /// Every pool of shard `index`, writer first
    ///
    /// # Errors
    ///
    /// Same as [`get_writer_by_index`](Self::get_writer_by_index).
    pub fn pools_of(&self, index: usize) -> Result<Vec<ShardHandle>> {
        let registry = self.registry()?;
        let shard = registry.shard(index)?;
        Ok(shard
            .pools()
            .map(|(role, pool)| ShardHandle {
                shard: index,
                role,
                pool: Arc::clone(pool),
            })
            .collect())
    }

    /// Close every pool of every shard concurrently
    ///
    /// The registry is detached first, so lookups fail with
    /// [`ShardError::NotInitialized`] as soon as this starts. All closures are
    /// attempted even when some fail. Calling this when not initialized does
    /// nothing.
    ///
    /// # Errors
    ///
    /// [`ShardError::Close`] listing every pool that failed to close. The
    /// manager is in the closed state either way.
    pub async fn close_all(&self) -> Result<()> {
        let registry = {
            let mut state = self.state.write();
            match std::mem::replace(&mut *state, ManagerState::Closed) {
                ManagerState::Initialized(registry) => registry,
                previous => {
                    *state = previous;
                    debug!("close_all on a manager that is not initialized");
                    return Ok(());
                }
            }
        };

        let pools: Vec<(usize, PoolRole, Arc<dyn ConnectionPool>)> = registry
            .iter()
            .flat_map(|shard| {
                shard
                    .pools()
                    .map(move |(role, pool)| (shard.index(), role, Arc::clone(pool)))
            })
            .collect();
        drop(registry);

        info!(pools = pools.len(), "Closing shard pools");
        let results = join_all(pools.into_iter().map(|(shard, role, pool)| async move {
            let outcome = pool.close().await;
            (shard, role, outcome)
        }))
        .await;

        let failures: Vec<CloseFailure> = results
            .into_iter()
            .filter_map(|(shard, role, outcome)| {
                outcome.err().map(|error| CloseFailure { shard, role, error })
            })
            .collect();

        if failures.is_empty() {
            info!("All shard pools closed");
            return Ok(());
        }
        for failure in &failures {
            warn!(
                shard = failure.shard,
                role = %failure.role,
                error = %failure.error,
                "Failed to close pool"
            );
        }
        Err(ShardError::Close { failures })
    }

    pub(crate) fn registry(&self) -> Result<Arc<ShardRegistry>> {
        match &*self.state.read() {
            ManagerState::Initialized(registry) => Ok(Arc::clone(registry)),
            ManagerState::Uninitialized | ManagerState::Closed => Err(ShardError::NotInitialized),
        }
    }
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("shards", &self.shard_count())
            .field("state", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

fn route(registry: &ShardRegistry, id: &Uuid) -> usize {
    // A built registry always holds at least one shard
    NonZeroUsize::new(registry.len()).map_or(0, |count| shard_index(id, count))
}

fn writer_of(registry: &ShardRegistry, index: usize) -> Result<ShardHandle> {
    let shard = registry.shard(index)?;
    Ok(ShardHandle {
        shard: index,
        role: PoolRole::Writer,
        pool: Arc::clone(shard.writer()),
    })
}

fn reader_of(registry: &ShardRegistry, index: usize) -> Result<ShardHandle> {
    let shard = registry.shard(index)?;
    if shard.readers().is_empty() {
        return Err(ConfigError::NoReadHosts { shard: index }.into());
    }
    let (i, pool) = shard.pick_reader();
    Ok(ShardHandle {
        shard: index,
        role: PoolRole::Reader(i),
        pool: Arc::clone(pool),
    })
}
