//! User Repository
//!
//! CRUD over the sharded `users` table. Every single-record operation routes
//! by the user's id; listing fans out to every shard.
//!
//! ```sql
//! CREATE TABLE users (
//!     id         UUID PRIMARY KEY,
//!     email      TEXT NOT NULL,
//!     name       TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::error::ShardError;
use crate::manager::ShardManager;
use crate::pool::{Record, SqlValue};

const COLUMNS: &str = "id, email, name, created_at, updated_at";
const MAX_NAME_LEN: usize = 255;

// ============================================================================
// Types
// ============================================================================

/// A stored user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Primary key, also the shard key
    pub id: Uuid,
    /// Email address
    pub email: String,
    /// Display name
    pub name: String,
    /// Insertion time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

/// Input for [`UserRepository::create`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUser {
    /// Email address
    pub email: String,
    /// Display name, 1 to 255 characters
    pub name: String,
}

/// Input for [`UserRepository::update`]; absent fields are left unchanged
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateUser {
    /// New email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// New display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UpdateUser {
    /// Whether no field would change
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.name.is_none()
    }
}

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Routing or pool failure, unchanged
    #[error(transparent)]
    Shard(#[from] ShardError),

    /// A returned row did not have the expected shape
    #[error("cannot decode column {column}: {reason}")]
    Decode {
        /// Offending column
        column: String,
        /// What was wrong with it
        reason: String,
    },

    /// Input rejected before touching any shard
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: &'static str,
    },
}

// ============================================================================
// Repository
// ============================================================================

/// User CRUD on top of a [`ShardManager`]
#[derive(Clone, Debug)]
pub struct UserRepository {
    shards: Arc<ShardManager>,
}

impl UserRepository {
    /// Repository using `shards`, which must be initialized before use
    #[must_use]
    pub fn new(shards: Arc<ShardManager>) -> Self {
        Self { shards }
    }

    /// Insert a user with a fresh v4 id on the writer of its shard
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Invalid`] for a malformed email or name, otherwise
    /// shard and decode failures.
    pub async fn create(&self, input: CreateUser) -> Result<User, RepositoryError> {
        validate_email(&input.email)?;
        validate_name(&input.name)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let writer = self.shards.get_writer(&id)?;
        debug!(id = %id, shard = writer.shard(), "Creating user");

        let statement = format!(
            "INSERT INTO users ({COLUMNS}) VALUES ($1, $2, $3, $4, $5) RETURNING {COLUMNS}"
        );
        let result = writer
            .execute(
                &statement,
                &[
                    SqlValue::Uuid(id),
                    SqlValue::Text(input.email),
                    SqlValue::Text(input.name),
                    SqlValue::Timestamp(now),
                    SqlValue::Timestamp(now),
                ],
            )
            .await?;

        match result.first() {
            Some(row) => decode_user(row),
            None => Err(RepositoryError::Decode {
                column: "id".to_string(),
                reason: "insert returned no row".to_string(),
            }),
        }
    }

    /// Fetch a user from a reader of its shard
    ///
    /// # Errors
    ///
    /// Shard and decode failures.
    pub async fn get(&self, id: &Uuid) -> Result<Option<User>, RepositoryError> {
        let reader = self.shards.get_reader(id)?;
        let statement = format!("SELECT {COLUMNS} FROM users WHERE id = $1");
        let result = reader.execute(&statement, &[SqlValue::Uuid(*id)]).await?;
        result.first().map(decode_user).transpose()
    }

    /// Change the given fields and bump `updated_at`
    ///
    /// With no fields set nothing is written and the current row is returned.
    /// `None` when the user does not exist.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Invalid`] for a malformed email or name, otherwise
    /// shard and decode failures.
    pub async fn update(
        &self,
        id: &Uuid,
        input: UpdateUser,
    ) -> Result<Option<User>, RepositoryError> {
        if input.is_empty() {
            return self.get(id).await;
        }

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        if let Some(email) = input.email {
            validate_email(&email)?;
            params.push(SqlValue::Text(email));
            assignments.push(format!("email = ${}", params.len()));
        }
        if let Some(name) = input.name {
            validate_name(&name)?;
            params.push(SqlValue::Text(name));
            assignments.push(format!("name = ${}", params.len()));
        }
        params.push(SqlValue::Timestamp(Utc::now()));
        assignments.push(format!("updated_at = ${}", params.len()));
        params.push(SqlValue::Uuid(*id));

        let statement = format!(
            "UPDATE users SET {} WHERE id = ${} RETURNING {COLUMNS}",
            assignments.join(", "),
            params.len()
        );

        let writer = self.shards.get_writer(id)?;
        debug!(id = %id, shard = writer.shard(), "Updating user");
        let result = writer.execute(&statement, &params).await?;
        result.first().map(decode_user).transpose()
    }

    /// Remove a user; `true` when a row was deleted
    ///
    /// # Errors
    ///
    /// Shard failures.
    pub async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let writer = self.shards.get_writer(id)?;
        debug!(id = %id, shard = writer.shard(), "Deleting user");
        let result = writer
            .execute("DELETE FROM users WHERE id = $1", &[SqlValue::Uuid(*id)])
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Every user on every shard, newest first
    ///
    /// # Errors
    ///
    /// [`ShardError::Aggregate`] if any shard fails, and decode failures.
    pub async fn list_all(&self) -> Result<Vec<User>, RepositoryError> {
        let statement = format!("SELECT {COLUMNS} FROM users ORDER BY created_at DESC");
        let rows = self
            .shards
            .scatter_gather(&statement, &[], "created_at")
            .await?;
        rows.iter().map(decode_user).collect()
    }
}

// ============================================================================
// Row Mapping and Validation
// ============================================================================

fn decode_user(row: &Record) -> Result<User, RepositoryError> {
    Ok(User {
        id: column(row, "id", SqlValue::as_uuid)?,
        email: column(row, "email", |v| v.as_text().map(str::to_string))?,
        name: column(row, "name", |v| v.as_text().map(str::to_string))?,
        created_at: column(row, "created_at", SqlValue::as_timestamp)?,
        updated_at: column(row, "updated_at", SqlValue::as_timestamp)?,
    })
}

fn column<T>(
    row: &Record,
    name: &str,
    convert: impl Fn(&SqlValue) -> Option<T>,
) -> Result<T, RepositoryError> {
    let value = row.get(name).ok_or_else(|| RepositoryError::Decode {
        column: name.to_string(),
        reason: "missing".to_string(),
    })?;
    convert(value).ok_or_else(|| RepositoryError::Decode {
        column: name.to_string(),
        reason: format!("unexpected value {value:?}"),
    })
}

fn validate_email(email: &str) -> Result<(), RepositoryError> {
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        })
        && !email.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(RepositoryError::Invalid {
            field: "email",
            reason: "not an email address",
        })
    }
}

fn validate_name(name: &str) -> Result<(), RepositoryError> {
    if name.is_empty() {
        return Err(RepositoryError::Invalid {
            field: "name",
            reason: "must not be empty",
        });
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(RepositoryError::Invalid {
            field: "name",
            reason: "longer than 255 characters",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{DatabaseDefaults, ShardConfig, ShardingConfig};
    use crate::pool::scripted::{ScriptedPool, ScriptedPoolFactory};
    use crate::pool::{PoolError, QueryResult};

    struct Fixture {
        repo: UserRepository,
        shards: Arc<ShardManager>,
        factory: Arc<ScriptedPoolFactory>,
    }

    impl Fixture {
        fn new(shard_count: usize) -> Self {
            let defaults = DatabaseDefaults::default();
            let config = ShardingConfig::with_shards(
                (0..shard_count)
                    .map(|i| {
                        ShardConfig::single_node(format!("w{i}"), &defaults)
                            .with_read_hosts([format!("r{i}")])
                    })
                    .collect(),
            );
            let factory = Arc::new(ScriptedPoolFactory::new());
            let shards = Arc::new(ShardManager::new(config, factory.clone()));
            shards.initialize().unwrap();
            Self {
                repo: UserRepository::new(shards.clone()),
                shards,
                factory,
            }
        }

        fn writer_for(&self, id: &Uuid) -> Arc<ScriptedPool> {
            let shard = self.shards.shard_for(id).unwrap();
            self.factory.latest(&format!("w{shard}")).unwrap()
        }

        fn reader_for(&self, id: &Uuid) -> Arc<ScriptedPool> {
            let shard = self.shards.shard_for(id).unwrap();
            self.factory.latest(&format!("r{shard}")).unwrap()
        }
    }

    fn user_row(id: Uuid, email: &str, created_at: DateTime<Utc>) -> Record {
        Record::new()
            .with("id", id)
            .with("email", email)
            .with("name", "Ada")
            .with("created_at", created_at)
            .with("updated_at", created_at)
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_get_routes_to_reader_of_owning_shard() {
        let fx = Fixture::new(4);
        let id = Uuid::new_v4();
        fx.reader_for(&id).set_rows(vec![user_row(id, "ada@example.com", at(1))]);

        let user = fx.repo.get(&id).await.unwrap().unwrap();

        assert_eq!(user.id, id);
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(fx.reader_for(&id).call_count(), 1);
        assert_eq!(fx.writer_for(&id).call_count(), 0);
        assert_eq!(fx.reader_for(&id).calls()[0].params, vec![SqlValue::Uuid(id)]);
    }

    #[tokio::test]
    async fn test_get_missing_user() {
        let fx = Fixture::new(2);
        assert_eq!(fx.repo.get(&Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_inserts_on_writer_of_generated_id() {
        let fx = Fixture::new(2);
        // Both writers echo a row; the id is only known after routing
        for i in 0..2 {
            let pool = fx.factory.latest(&format!("w{i}")).unwrap();
            pool.set_rows(vec![user_row(Uuid::nil(), "ada@example.com", at(2))]);
        }

        fx.repo
            .create(CreateUser {
                email: "ada@example.com".to_string(),
                name: "Ada".to_string(),
            })
            .await
            .unwrap();

        let calls: Vec<_> = (0..2)
            .flat_map(|i| fx.factory.latest(&format!("w{i}")).unwrap().calls())
            .collect();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].statement.starts_with("INSERT INTO users"));

        let id = calls[0].params[0].as_uuid().unwrap();
        assert_eq!(fx.writer_for(&id).call_count(), 1);
        assert_eq!(calls[0].params[1], SqlValue::Text("ada@example.com".to_string()));
        assert_eq!(calls[0].params[3], calls[0].params[4]);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input_without_io() {
        let fx = Fixture::new(1);

        let err = fx
            .repo
            .create(CreateUser {
                email: "not-an-email".to_string(),
                name: "Ada".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Invalid { field: "email", .. }));

        let err = fx
            .repo
            .create(CreateUser {
                email: "ada@example.com".to_string(),
                name: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Invalid { field: "name", .. }));
        assert!(fx.factory.created().iter().all(|p| p.call_count() == 0));
    }

    #[tokio::test]
    async fn test_update_builds_partial_statement() {
        let fx = Fixture::new(2);
        let id = Uuid::new_v4();
        fx.writer_for(&id).set_rows(vec![user_row(id, "new@example.com", at(3))]);

        let user = fx
            .repo
            .update(
                &id,
                UpdateUser {
                    email: Some("new@example.com".to_string()),
                    name: None,
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(user.email, "new@example.com");
        let call = &fx.writer_for(&id).calls()[0];
        let expected = format!(
            "UPDATE users SET email = $1, updated_at = $2 WHERE id = $3 RETURNING {COLUMNS}"
        );
        assert_eq!(call.statement, expected);
        assert_eq!(call.params.len(), 3);
        assert_eq!(call.params[2], SqlValue::Uuid(id));
    }

    #[tokio::test]
    async fn test_empty_update_reads_instead() {
        let fx = Fixture::new(2);
        let id = Uuid::new_v4();
        fx.reader_for(&id).set_rows(vec![user_row(id, "ada@example.com", at(4))]);

        let user = fx.repo.update(&id, UpdateUser::default()).await.unwrap();

        assert!(user.is_some());
        assert_eq!(fx.writer_for(&id).call_count(), 0);
        assert_eq!(fx.reader_for(&id).call_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_removed_row() {
        let fx = Fixture::new(2);
        let id = Uuid::new_v4();
        let writer = fx.writer_for(&id);
        writer.push_result(Ok(QueryResult {
            rows: Vec::new(),
            rows_affected: 1,
        }));

        assert!(fx.repo.delete(&id).await.unwrap());
        assert!(!fx.repo.delete(&id).await.unwrap());
        assert_eq!(writer.call_count(), 2);
    }

    #[tokio::test]
    async fn test_list_all_newest_first_across_shards() {
        let fx = Fixture::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        fx.factory
            .latest("r0")
            .unwrap()
            .set_rows(vec![
                user_row(a, "a@example.com", at(9)),
                user_row(b, "b@example.com", at(2)),
            ]);
        fx.factory
            .latest("r1")
            .unwrap()
            .set_rows(vec![user_row(c, "c@example.com", at(5))]);

        let users = fx.repo.list_all().await.unwrap();

        let ids: Vec<Uuid> = users.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![a, c, b]);
    }

    #[tokio::test]
    async fn test_shard_errors_pass_through() {
        let fx = Fixture::new(2);
        let id = Uuid::new_v4();
        fx.reader_for(&id).fail_execute(PoolError::Timeout);

        let err = fx.repo.get(&id).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Shard(ShardError::Pool {
                source: PoolError::Timeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_malformed_row_is_decode_error() {
        let fx = Fixture::new(1);
        let id = Uuid::new_v4();
        fx.reader_for(&id).set_rows(vec![Record::new()
            .with("id", id)
            .with("email", "ada@example.com")
            .with("name", "Ada")
            .with("created_at", "yesterday")
            .with("updated_at", at(1))]);

        let err = fx.repo.get(&id).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Decode { ref column, .. } if column == "created_at"
        ));
    }

    #[test]
    fn test_user_serializes_camel_case() {
        let user = User {
            id: Uuid::nil(),
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
            created_at: at(1),
            updated_at: at(1),
        };

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn test_email_validation() {
        for ok in ["a@b.co", "first.last@example.org"] {
            assert!(validate_email(ok).is_ok(), "{ok}");
        }
        for bad in ["", "a@", "@b.co", "a@b", "a b@c.de", "a@b@c.de", "a@.com"] {
            assert!(validate_email(bad).is_err(), "{bad}");
        }
    }
}
