//! Postgres backend. The registry table lives in the shared `eventodb`
//! schema; every namespace owns a `ns_<id>` schema whose `messages` table
//! carries a `bigserial` global position.
//!
//! Writes take an exclusive, transaction-level advisory lock keyed by the
//! 64-bit hash of `<namespace>:<category>`, so all writes to streams in one
//! category queue and commit in sequence while other categories proceed.
//! The consumer-group filter evaluates the same hash in SQL that the rest of
//! the system computes in process.
//!
//! A namespace's schema is created and registered in a single transaction;
//! a registry row whose schema is not visible yet (a concurrent create past
//! the insert, before commit propagation) is absorbed by a bounded retry.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use eventodb::error::{Error, Result};
use eventodb::namespace::{validate_namespace_id, Namespace, NamespaceStats};
use eventodb::store::{
    effective_batch_size, GetCategoryMessagesOpts, GetStreamMessagesOpts, Store, StoreHealth,
    WriteMessageOpts, WrittenMessage,
};
use eventodb::stream_name::{hash64, Category, StreamName};
use eventodb::Message;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use sqlx::error::ErrorKind;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

const VISIBILITY_RETRIES: u32 = 3;
const VISIBILITY_BACKOFF: Duration = Duration::from_millis(25);

/// `invalid_schema_name` and `undefined_table`: the namespace's container is
/// not visible to this session (yet).
const MISSING_CONTAINER_CODES: [&str; 2] = ["3F000", "42P01"];

const METADATA_SCHEMA: [&str; 2] = [
    "CREATE SCHEMA IF NOT EXISTS eventodb",
    r#"CREATE TABLE IF NOT EXISTS eventodb.namespaces (
    id text PRIMARY KEY,
    token_hash text NOT NULL,
    description text,
    created_at timestamptz NOT NULL
)"#,
];

const MESSAGE_COLUMNS: &str =
    r#"id, stream_name, "type", position, global_position, data, metadata, time"#;

#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

fn schema_name(namespace: &str) -> Result<String> {
    validate_namespace_id(namespace)?;
    Ok(format!("ns_{namespace}"))
}

/// The per-namespace migration set, with the schema name substituted in.
fn namespace_migration(schema: &str) -> Vec<String> {
    vec![
        format!(r#"CREATE SCHEMA "{schema}""#),
        format!(
            r#"CREATE TABLE "{schema}".messages (
    global_position bigserial PRIMARY KEY,
    id uuid NOT NULL UNIQUE,
    stream_name text NOT NULL,
    category text NOT NULL,
    cardinal_id text NOT NULL,
    "type" text NOT NULL,
    position bigint NOT NULL,
    data jsonb NOT NULL,
    metadata jsonb,
    time timestamptz NOT NULL,
    UNIQUE (stream_name, position)
)"#
        ),
        format!(r#"CREATE INDEX messages_stream_idx ON "{schema}".messages (stream_name, position)"#),
        format!(
            r#"CREATE INDEX messages_category_idx ON "{schema}".messages (category, global_position)"#
        ),
    ]
}

fn row_to_message(row: &PgRow) -> Result<Message<'static>> {
    let stream_name: String = row.try_get("stream_name").map_err(Error::backend)?;
    let msg_type: String = row.try_get("type").map_err(Error::backend)?;
    let data: Value = row.try_get("data").map_err(Error::backend)?;
    let metadata: Option<Value> = row.try_get("metadata").map_err(Error::backend)?;

    Ok(Message {
        id: row.try_get("id").map_err(Error::backend)?,
        stream_name: StreamName::new(stream_name)?.into_owned(),
        msg_type: Cow::Owned(msg_type),
        position: row.try_get("position").map_err(Error::backend)?,
        global_position: row.try_get("global_position").map_err(Error::backend)?,
        data: Cow::Owned(data),
        metadata: metadata.map(Cow::Owned),
        time: row.try_get("time").map_err(Error::backend)?,
    })
}

fn is_missing_container(err: &Error) -> bool {
    let Error::Backend(err) = err else {
        return false;
    };
    let Some(sqlx::Error::Database(db_err)) = err.downcast_ref::<sqlx::Error>() else {
        return false;
    };
    db_err
        .code()
        .map(|code| MISSING_CONTAINER_CODES.contains(&code.as_ref()))
        .unwrap_or(false)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if matches!(db_err.kind(), ErrorKind::UniqueViolation))
}

impl PostgresStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await.map_err(Error::backend)?;
        for statement in METADATA_SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(Error::backend)?;
        }

        Ok(PostgresStore { pool })
    }

    async fn registry_record(&self, id: &str) -> Result<Namespace> {
        let row = sqlx::query(
            "SELECT id, token_hash, description, created_at FROM eventodb.namespaces WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::backend)?
        .ok_or_else(|| Error::NamespaceNotFound(id.to_string()))?;

        row_to_namespace(&row)
    }

    /// Runs a namespace-scoped operation, absorbing the window in which a
    /// freshly registered namespace's schema is not visible yet. A missing
    /// schema with no registry row is a plain `NamespaceNotFound`.
    async fn with_namespace<'a, T>(
        &'a self,
        namespace: &'a str,
        op: impl Fn() -> BoxFuture<'a, Result<T>> + 'a,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_missing_container(&err) => {
                    self.registry_record(namespace).await?;
                    if attempt >= VISIBILITY_RETRIES {
                        return Err(err);
                    }
                    attempt += 1;
                    tokio::time::sleep(VISIBILITY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn row_to_namespace(row: &PgRow) -> Result<Namespace> {
    Ok(Namespace {
        id: row.try_get("id").map_err(Error::backend)?,
        token_hash: row.try_get("token_hash").map_err(Error::backend)?,
        description: row.try_get("description").map_err(Error::backend)?,
        created_at: row.try_get("created_at").map_err(Error::backend)?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn write_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: &str,
        data: &Value,
        opts: &WriteMessageOpts<'_>,
    ) -> Result<WrittenMessage> {
        let schema = schema_name(namespace)?;
        let category = stream_name.category();
        let lock_key = hash64(&format!("{namespace}:{category}"));
        let id = opts.id.unwrap_or_else(Uuid::new_v4);
        let schema = &schema;
        let category = &category;

        self.with_namespace(namespace, move || {
            async move {
                let mut tx = self.pool.begin().await.map_err(Error::backend)?;

                sqlx::query("SELECT pg_advisory_xact_lock($1)")
                    .bind(lock_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::backend)?;

                let version: Option<i64> = sqlx::query_scalar(&format!(
                    r#"SELECT MAX(position) FROM "{schema}".messages WHERE stream_name = $1"#
                ))
                .bind(stream_name.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::backend)?;
                let version = version.unwrap_or(-1);

                if let Some(expected) = opts.expected_version {
                    if expected != version {
                        return Err(Error::WrongExpectedVersion {
                            stream_name: stream_name.to_string(),
                            expected,
                            actual: version,
                        });
                    }
                }

                let position = version + 1;
                let time = Utc::now();
                let global_position: i64 = sqlx::query_scalar(&format!(
                    r#"INSERT INTO "{schema}".messages
                           (id, stream_name, category, cardinal_id, "type", position, data, metadata, time)
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                       RETURNING global_position"#
                ))
                .bind(id)
                .bind(stream_name.as_str())
                .bind(category.as_str())
                .bind(stream_name.cardinal_id())
                .bind(msg_type)
                .bind(position)
                .bind(data)
                .bind(opts.metadata)
                .bind(time)
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::backend)?;

                tx.commit().await.map_err(Error::backend)?;

                info!(
                    namespace,
                    stream_name = %stream_name,
                    msg_type,
                    position,
                    global_position,
                    "message written"
                );

                Ok(WrittenMessage {
                    position,
                    global_position,
                    time,
                })
            }
            .boxed()
        })
        .await
    }

    async fn get_stream_messages(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        opts: &GetStreamMessagesOpts,
    ) -> Result<Vec<Message<'static>>> {
        let schema = schema_name(namespace)?;
        let position = opts.position.unwrap_or(0).max(0);
        let global_position = opts.global_position.unwrap_or(0);
        let batch = effective_batch_size(opts.batch_size);

        let mut sql = format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM "{schema}".messages
               WHERE stream_name = $1 AND position >= $2 AND global_position >= $3
               ORDER BY position ASC"#
        );
        if let Some(limit) = batch {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let sql = &sql;

        self.with_namespace(namespace, move || {
            async move {
                let rows = sqlx::query(sql)
                    .bind(stream_name.as_str())
                    .bind(position)
                    .bind(global_position)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(Error::backend)?;

                rows.iter().map(row_to_message).collect()
            }
            .boxed()
        })
        .await
    }

    async fn get_category_messages(
        &self,
        namespace: &str,
        category: &Category<'_>,
        opts: &GetCategoryMessagesOpts<'_>,
    ) -> Result<Vec<Message<'static>>> {
        let schema = schema_name(namespace)?;
        let position = opts.position.unwrap_or(1).max(1);
        let batch = effective_batch_size(opts.batch_size);

        // Both filters run inside the query; the consumer-group expression
        // is the SQL spelling of `consumer_member`.
        let mut sql = format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM "{schema}".messages
               WHERE category = $1 AND global_position >= $2
                 AND ($3::text IS NULL
                      OR split_part(metadata->>'correlationStreamName', '-', 1) = $3)
                 AND ($4::bigint IS NULL
                      OR abs(('x' || left(md5(cardinal_id), 16))::bit(64)::bigint) % $5 = $4)
               ORDER BY global_position ASC"#
        );
        if let Some(limit) = batch {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let sql = &sql;

        self.with_namespace(namespace, move || {
            async move {
                let rows = sqlx::query(sql)
                    .bind(category.as_str())
                    .bind(position)
                    .bind(opts.correlation)
                    .bind(opts.consumer_group_member)
                    .bind(opts.consumer_group_size)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(Error::backend)?;

                rows.iter().map(row_to_message).collect()
            }
            .boxed()
        })
        .await
    }

    async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
        msg_type: Option<&str>,
    ) -> Result<Option<Message<'static>>> {
        let schema = schema_name(namespace)?;

        let mut sql = format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM "{schema}".messages WHERE stream_name = $1"#
        );
        if msg_type.is_some() {
            sql.push_str(r#" AND "type" = $2"#);
        }
        sql.push_str(" ORDER BY position DESC LIMIT 1");
        let sql = &sql;

        self.with_namespace(namespace, move || {
            async move {
                let mut query = sqlx::query(sql).bind(stream_name.as_str());
                if let Some(msg_type) = msg_type {
                    query = query.bind(msg_type);
                }

                let row = query
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(Error::backend)?;
                row.as_ref().map(row_to_message).transpose()
            }
            .boxed()
        })
        .await
    }

    async fn stream_version(
        &self,
        namespace: &str,
        stream_name: &StreamName<'_>,
    ) -> Result<Option<i64>> {
        let schema = schema_name(namespace)?;
        let sql = format!(
            r#"SELECT MAX(position) FROM "{schema}".messages WHERE stream_name = $1"#
        );
        let sql = &sql;

        self.with_namespace(namespace, move || {
            async move {
                sqlx::query_scalar(sql)
                    .bind(stream_name.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(Error::backend)
            }
            .boxed()
        })
        .await
    }

    async fn create_namespace(
        &self,
        id: &str,
        token_hash: &str,
        description: Option<&str>,
    ) -> Result<Namespace> {
        let schema = schema_name(id)?;
        let created_at = Utc::now();

        // Registry row and schema build share one transaction; Postgres DDL
        // is transactional, so neither outlives a failure of the other.
        let mut tx = self.pool.begin().await.map_err(Error::backend)?;

        let inserted = sqlx::query(
            "INSERT INTO eventodb.namespaces (id, token_hash, description, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(token_hash)
        .bind(description)
        .bind(created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(Error::NamespaceExists(id.to_string()));
            }
            Err(err) => return Err(Error::backend(err)),
        }

        for statement in namespace_migration(&schema) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(Error::backend)?;
        }

        tx.commit().await.map_err(Error::backend)?;

        info!(namespace = id, "namespace created");

        Ok(Namespace {
            id: id.to_string(),
            token_hash: token_hash.to_string(),
            description: description.map(str::to_string),
            created_at,
        })
    }

    async fn delete_namespace(&self, id: &str) -> Result<i64> {
        let schema = schema_name(id)?;

        let mut tx = self.pool.begin().await.map_err(Error::backend)?;

        let result = sqlx::query("DELETE FROM eventodb.namespaces WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::backend)?;
        if result.rows_affected() == 0 {
            return Err(Error::NamespaceNotFound(id.to_string()));
        }

        let deleted: i64 =
            sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM "{schema}".messages"#))
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::backend)?;

        sqlx::query(&format!(r#"DROP SCHEMA "{schema}" CASCADE"#))
            .execute(&mut *tx)
            .await
            .map_err(Error::backend)?;

        tx.commit().await.map_err(Error::backend)?;

        info!(namespace = id, messages_deleted = deleted, "namespace deleted");

        Ok(deleted)
    }

    async fn get_namespace(&self, id: &str) -> Result<Namespace> {
        self.registry_record(id).await
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let rows = sqlx::query(
            "SELECT id, token_hash, description, created_at FROM eventodb.namespaces ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::backend)?;

        rows.iter().map(row_to_namespace).collect()
    }

    async fn namespace_stats(&self, id: &str) -> Result<NamespaceStats> {
        let schema = schema_name(id)?;
        let sql = format!(
            r#"SELECT COUNT(*) AS count, MAX(global_position) AS last FROM "{schema}".messages"#
        );
        let sql = &sql;

        self.with_namespace(id, move || {
            async move {
                let row = sqlx::query(sql)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(Error::backend)?;

                Ok(NamespaceStats {
                    message_count: row.try_get("count").map_err(Error::backend)?,
                    last_global_position: row.try_get("last").map_err(Error::backend)?,
                })
            }
            .boxed()
        })
        .await
    }

    async fn health(&self) -> Result<StoreHealth> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;

        Ok(StoreHealth {
            backend: "postgres",
            connections: self.pool.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_validated() {
        assert_eq!(schema_name("default").unwrap(), "ns_default");
        assert_eq!(schema_name("my-app").unwrap(), "ns_my-app");
        assert!(schema_name(r#"x"; DROP SCHEMA eventodb; --"#).is_err());
        assert!(schema_name("").is_err());
    }

    #[test]
    fn advisory_lock_key_is_category_scoped() {
        let a = hash64("default:order");
        let b = hash64("default:account");
        let c = hash64("other:order");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, hash64("default:order"));
    }
}
