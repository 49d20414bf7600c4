//! Shard Registry
//!
//! Holds, per shard index, one writer pool and an ordered list of reader
//! pools. The registry is built in one piece from the configuration and torn
//! down in one piece; it is never mutated in between.

use std::sync::Arc;

use rand::Rng;

use crate::config::{ConfigError, ShardingConfig};
use crate::error::{Result, ShardError};
use crate::pool::{ConnectionPool, PoolFactory, PoolRole};

/// One shard and the pools it owns
pub struct Shard {
    index: usize,
    writer: Arc<dyn ConnectionPool>,
    readers: Vec<Arc<dyn ConnectionPool>>,
}

impl Shard {
    /// Position in the configuration list
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The writer pool
    #[must_use]
    pub fn writer(&self) -> &Arc<dyn ConnectionPool> {
        &self.writer
    }

    /// The reader pools, in configured order
    #[must_use]
    pub fn readers(&self) -> &[Arc<dyn ConnectionPool>] {
        &self.readers
    }

    /// Pick a reader uniformly at random
    ///
    /// Every call draws independently, so repeated reads of one record spread
    /// over all replicas.
    pub fn pick_reader(&self) -> (usize, &Arc<dyn ConnectionPool>) {
        let i = rand::thread_rng().gen_range(0..self.readers.len());
        (i, &self.readers[i])
    }

    /// Every pool of this shard with its role, writer first
    pub fn pools(&self) -> impl Iterator<Item = (PoolRole, &Arc<dyn ConnectionPool>)> {
        std::iter::once((PoolRole::Writer, &self.writer)).chain(
            self.readers
                .iter()
                .enumerate()
                .map(|(i, pool)| (PoolRole::Reader(i), pool)),
        )
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.index)
            .field("writer", &self.writer.endpoint())
            .field(
                "readers",
                &self.readers.iter().map(|r| r.endpoint()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// All shards, indexed by position
#[derive(Debug)]
pub struct ShardRegistry {
    shards: Vec<Shard>,
}

impl ShardRegistry {
    /// Build every shard from the configuration, in order
    ///
    /// Creating pools does not connect, so this never suspends.
    ///
    /// # Errors
    ///
    /// [`ShardError::Configuration`] for an empty shard list or a shard
    /// without read hosts, [`ShardError::Pool`] if the factory rejects an
    /// endpoint. Pools created before a failure are dropped unused.
    pub fn build(config: &ShardingConfig, factory: &dyn PoolFactory) -> Result<Self> {
        config.validate()?;

        let mut shards = Vec::with_capacity(config.shards.len());
        for (index, shard_config) in config.shards.iter().enumerate() {
            let writer = factory
                .create(&shard_config.writer_endpoint(), &config.pool)
                .map_err(|source| ShardError::Pool {
                    shard: index,
                    role: PoolRole::Writer,
                    source,
                })?;

            let readers = shard_config
                .reader_endpoints()
                .iter()
                .enumerate()
                .map(|(i, endpoint)| {
                    factory
                        .create(endpoint, &config.pool)
                        .map_err(|source| ShardError::Pool {
                            shard: index,
                            role: PoolRole::Reader(i),
                            source,
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            shards.push(Shard {
                index,
                writer,
                readers,
            });
        }

        Ok(Self { shards })
    }

    /// Number of shards
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the registry holds no shards
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard at `index`
    ///
    /// # Errors
    ///
    /// [`ConfigError::ShardIndexOutOfRange`] when `index >= len()`.
    pub fn shard(&self, index: usize) -> Result<&Shard> {
        self.shards.get(index).ok_or_else(|| {
            ShardError::Configuration(ConfigError::ShardIndexOutOfRange {
                index,
                count: self.shards.len(),
            })
        })
    }

    /// All shards in index order
    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter()
    }

    /// Total number of pools across all shards
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.shards.iter().map(|s| 1 + s.readers.len()).sum()
    }
}
