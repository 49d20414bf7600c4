//! Scatter-Gather
//!
//! Runs one read statement against a reader of every shard at once and merges
//! the rows into a single list sorted descending by a key.
//!
//! # Design
//!
//! - All shard queries start together; the total latency is that of the
//!   slowest shard, not the sum.
//! - All-or-nothing: the first failing shard fails the whole call and no
//!   partial rows are returned.
//! - `scatter_max_concurrency` optionally caps how many shard queries are in
//!   flight at once.

use std::cmp::Ordering;

use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Result, ShardError};
use crate::manager::{ShardHandle, ShardManager};
use crate::pool::{Record, SqlValue};

static NULL: SqlValue = SqlValue::Null;

impl ShardManager {
    /// Query a reader of every shard and merge the rows descending by
    /// `order_key`
    ///
    /// Rows without the column sort as NULL, below every other value.
    ///
    /// # Errors
    ///
    /// [`ShardError::NotInitialized`] outside the initialized state,
    /// [`ShardError::Aggregate`] naming the first shard whose query failed.
    pub async fn scatter_gather(
        &self,
        statement: &str,
        params: &[SqlValue],
        order_key: &str,
    ) -> Result<Vec<Record>> {
        self.scatter_gather_by(statement, params, by_column(order_key))
            .await
    }

    /// Like [`scatter_gather`](Self::scatter_gather) with a custom ordering
    ///
    /// `compare` defines ascending order; the merged result is its reverse.
    ///
    /// # Errors
    ///
    /// Same as [`scatter_gather`](Self::scatter_gather).
    pub async fn scatter_gather_by<F>(
        &self,
        statement: &str,
        params: &[SqlValue],
        compare: F,
    ) -> Result<Vec<Record>>
    where
        F: Fn(&Record, &Record) -> Ordering,
    {
        let readers = (0..self.shard_count())
            .map(|index| self.get_reader_by_index(index))
            .collect::<Result<Vec<_>>>()?;
        let limit = self
            .config
            .scatter_max_concurrency
            .map(|n| Semaphore::new(n.max(1)));

        debug!(
            shards = readers.len(),
            limit = ?self.config.scatter_max_concurrency,
            "Scatter-gather started"
        );

        let queries = readers
            .iter()
            .map(|reader| query_shard(reader, statement, params, limit.as_ref()));
        let batches = try_join_all(queries).await?;

        let rows = merge_descending(batches, compare);
        debug!(rows = rows.len(), "Scatter-gather merged");
        Ok(rows)
    }
}

async fn query_shard(
    reader: &ShardHandle,
    statement: &str,
    params: &[SqlValue],
    limit: Option<&Semaphore>,
) -> Result<Vec<Record>> {
    // The semaphore is local to one call and never closed
    let _permit = match limit {
        Some(semaphore) => semaphore.acquire().await.ok(),
        None => None,
    };

    let result = reader
        .pool()
        .execute(statement, params)
        .await
        .map_err(|source| {
            warn!(
                shard = reader.shard(),
                role = %reader.role(),
                error = %source,
                "Scatter-gather shard query failed"
            );
            ShardError::Aggregate {
                shard: reader.shard(),
                role: reader.role(),
                source,
            }
        })?;
    Ok(result.rows)
}

/// Flatten per-shard batches and sort them descending under `compare`
///
/// The sort is stable, so rows that compare equal keep shard order.
pub fn merge_descending<F>(batches: Vec<Vec<Record>>, compare: F) -> Vec<Record>
where
    F: Fn(&Record, &Record) -> Ordering,
{
    let mut rows: Vec<Record> = batches.into_iter().flatten().collect();
    rows.sort_by(|a, b| compare(b, a));
    rows
}

/// Ascending comparison on one column, using [`SqlValue::sort_cmp`]
pub fn by_column(column: &str) -> impl Fn(&Record, &Record) -> Ordering + '_ {
    move |a, b| {
        let left = a.get(column).unwrap_or(&NULL);
        let right = b.get(column).unwrap_or(&NULL);
        left.sort_cmp(right)
    }
}
