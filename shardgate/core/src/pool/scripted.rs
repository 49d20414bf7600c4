//! Scripted Pools
//!
//! In-memory [`ConnectionPool`] implementation for exercising routing,
//! lifecycle and scatter-gather without a database. Pools return canned rows,
//! can be told to fail, and record every statement they receive.
//!
//! # Usage
//!
//! ```ignore
//! let factory = Arc::new(ScriptedPoolFactory::new());
//! let manager = ShardManager::new(config, factory.clone());
//! manager.initialize()?;
//!
//! factory.latest("pg-1").unwrap().fail_execute(PoolError::Timeout);
//! assert_eq!(factory.latest("pg-0").unwrap().call_count(), 0);
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use super::{ConnectionPool, Endpoint, PoolError, PoolFactory, QueryResult, Record, SqlValue};
use crate::config::PoolSettings;

// ============================================================================
// Request Tracking
// ============================================================================

/// A statement received by a scripted pool
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    /// Statement text
    pub statement: String,
    /// Positional parameters
    pub params: Vec<SqlValue>,
}

#[derive(Default)]
struct Script {
    default_rows: Vec<Record>,
    queued: VecDeque<Result<QueryResult, PoolError>>,
    execute_error: Option<PoolError>,
    close_error: Option<PoolError>,
    gate: Option<Arc<Barrier>>,
    calls: Vec<RecordedCall>,
    close_calls: usize,
    closed: bool,
}

// ============================================================================
// Scripted Pool
// ============================================================================

/// Pool answering from a script
pub struct ScriptedPool {
    host: String,
    address: String,
    script: Mutex<Script>,
}

impl ScriptedPool {
    /// New pool answering every statement with no rows
    #[must_use]
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            host: endpoint.host.clone(),
            address: endpoint.address(),
            script: Mutex::new(Script::default()),
        }
    }

    /// Host this pool was created for
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Rows returned whenever no queued result is pending
    pub fn set_rows(&self, rows: Vec<Record>) {
        self.script.lock().default_rows = rows;
    }

    /// Queue a one-shot result for the next statement
    pub fn push_result(&self, result: Result<QueryResult, PoolError>) {
        self.script.lock().queued.push_back(result);
    }

    /// Fail every statement with `error`
    pub fn fail_execute(&self, error: PoolError) {
        self.script.lock().execute_error = Some(error);
    }

    /// Fail the first `close` with `error`
    pub fn fail_close(&self, error: PoolError) {
        self.script.lock().close_error = Some(error);
    }

    /// Wait on `barrier` before answering each statement
    pub fn gate_on(&self, barrier: Arc<Barrier>) {
        self.script.lock().gate = Some(barrier);
    }

    /// Statements received so far
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.lock().calls.clone()
    }

    /// Number of statements received so far
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.script.lock().calls.len()
    }

    /// Number of `close` calls, including repeated ones
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.script.lock().close_calls
    }

    /// Whether the pool has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.script.lock().closed
    }
}

#[async_trait]
impl ConnectionPool for ScriptedPool {
    fn endpoint(&self) -> &str {
        &self.address
    }

    async fn execute(
        &self,
        statement: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult, PoolError> {
        let gate = {
            let mut script = self.script.lock();
            if script.closed {
                return Err(PoolError::Closed);
            }
            script.calls.push(RecordedCall {
                statement: statement.to_string(),
                params: params.to_vec(),
            });
            script.gate.clone()
        };

        if let Some(barrier) = gate {
            barrier.wait().await;
        }

        let mut script = self.script.lock();
        if let Some(error) = script.execute_error.clone() {
            return Err(error);
        }
        match script.queued.pop_front() {
            Some(result) => result,
            None => Ok(QueryResult::from_rows(script.default_rows.clone())),
        }
    }

    async fn close(&self) -> Result<(), PoolError> {
        let mut script = self.script.lock();
        script.close_calls += 1;
        if script.closed {
            return Ok(());
        }
        script.closed = true;
        match script.close_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Scripted Factory
// ============================================================================

/// Factory handing out [`ScriptedPool`]s and remembering each one
#[derive(Default)]
pub struct ScriptedPoolFactory {
    created: Mutex<Vec<Arc<ScriptedPool>>>,
    rejected_hosts: Mutex<HashSet<String>>,
}

impl ScriptedPoolFactory {
    /// New factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail for `host`
    pub fn reject_host(&self, host: impl Into<String>) {
        self.rejected_hosts.lock().insert(host.into());
    }

    /// Every pool created so far, in creation order
    #[must_use]
    pub fn created(&self) -> Vec<Arc<ScriptedPool>> {
        self.created.lock().clone()
    }

    /// Most recently created pool for `host`
    #[must_use]
    pub fn latest(&self, host: &str) -> Option<Arc<ScriptedPool>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|p| p.host() == host)
            .cloned()
    }
}

impl PoolFactory for ScriptedPoolFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        _settings: &PoolSettings,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        if self.rejected_hosts.lock().contains(&endpoint.host) {
            return Err(PoolError::ConnectionFailed(format!(
                "host {} rejected",
                endpoint.host
            )));
        }

        let pool = Arc::new(ScriptedPool::new(endpoint));
        self.created.lock().push(Arc::clone(&pool));
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "app_db".to_string(),
        }
    }

    #[tokio::test]
    async fn test_records_calls_and_returns_rows() {
        let pool = ScriptedPool::new(&endpoint("pg-0"));
        pool.set_rows(vec![Record::new().with("n", 1_i64)]);

        let result = pool
            .execute("SELECT n FROM t WHERE id = $1", &[SqlValue::Int(7)])
            .await
            .unwrap();

        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows_affected, 1);
        assert_eq!(
            pool.calls(),
            vec![RecordedCall {
                statement: "SELECT n FROM t WHERE id = $1".to_string(),
                params: vec![SqlValue::Int(7)],
            }]
        );
    }

    #[tokio::test]
    async fn test_queued_results_take_precedence() {
        let pool = ScriptedPool::new(&endpoint("pg-0"));
        pool.push_result(Ok(QueryResult {
            rows: Vec::new(),
            rows_affected: 3,
        }));

        assert_eq!(pool.execute("DELETE", &[]).await.unwrap().rows_affected, 3);
        assert_eq!(pool.execute("DELETE", &[]).await.unwrap().rows_affected, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = ScriptedPool::new(&endpoint("pg-0"));
        pool.fail_close(PoolError::ConnectionFailed("reset".to_string()));

        assert!(pool.close().await.is_err());
        assert!(pool.close().await.is_ok());
        assert_eq!(pool.close_calls(), 2);
        assert!(matches!(pool.execute("SELECT 1", &[]).await, Err(PoolError::Closed)));
    }

    #[test]
    fn test_factory_rejects_host() {
        let factory = ScriptedPoolFactory::new();
        factory.reject_host("bad");

        assert!(factory.create(&endpoint("bad"), &PoolSettings::default()).is_err());
        assert!(factory.create(&endpoint("good"), &PoolSettings::default()).is_ok());
        assert_eq!(factory.created().len(), 1);
        assert!(factory.latest("good").is_some());
    }
}
