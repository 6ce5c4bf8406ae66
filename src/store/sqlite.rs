//! SQLite implementation of the store capability set.
//!
//! Lists, hashes and sorted sets each map onto one table. Every batch runs in
//! a single transaction. The pool holds one connection, so transactions are
//! serialized and a read-then-write batch never races another writer.

use std::collections::HashMap;

use bytes::Bytes;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqliteConnection, SqlitePool,
};
use tokio_stream::StreamExt;

use crate::error::StoreError;

use super::{End, Guard, Op, Store, StoreFuture};

#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema. `None` opens a private in-memory database.
    pub async fn connect(path: Option<&str>) -> Result<Self, StoreError> {
        let opts = if let Some(path) = path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // An in-memory database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = path.unwrap_or(":memory:"), "opened sqlite store");

        Ok(Self { db: pool })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }
}

async fn push(
    db: &mut SqliteConnection,
    key: &str,
    value: &str,
    to: End,
) -> Result<i64, sqlx::Error> {
    let sql = match to {
        End::Left => {
            "
            INSERT INTO list_entries (key, seq, value)
            VALUES ($1, COALESCE((SELECT MIN(seq) FROM list_entries WHERE key = $1), 0) - 1, $2)
            "
        }
        End::Right => {
            "
            INSERT INTO list_entries (key, seq, value)
            VALUES ($1, COALESCE((SELECT MAX(seq) FROM list_entries WHERE key = $1), 0) + 1, $2)
            "
        }
    };

    sqlx::query(sql)
        .bind(key)
        .bind(value)
        .execute(&mut *db)
        .await?;

    sqlx::query_scalar("SELECT COUNT(*) FROM list_entries WHERE key = $1")
        .bind(key)
        .fetch_one(&mut *db)
        .await
}

async fn remove(
    db: &mut SqliteConnection,
    key: &str,
    value: &str,
    count: i64,
) -> Result<i64, sqlx::Error> {
    let order = if count < 0 { "DESC" } else { "ASC" };
    // A negative LIMIT means no limit in SQLite.
    let limit = if count == 0 { -1 } else { count.abs() };

    let result = sqlx::query(&format!(
        "
        DELETE FROM list_entries
        WHERE key = $1 AND seq IN (
            SELECT seq FROM list_entries
            WHERE key = $1 AND value = $2
            ORDER BY seq {order}
            LIMIT $3
        )
        "
    ))
    .bind(key)
    .bind(value)
    .bind(limit)
    .execute(&mut *db)
    .await?;

    Ok(result.rows_affected() as i64)
}

async fn hash_field(
    db: &mut SqliteConnection,
    key: &str,
    field: &str,
) -> Result<Option<Vec<u8>>, sqlx::Error> {
    sqlx::query_scalar("SELECT value FROM hash_fields WHERE key = $1 AND field = $2")
        .bind(key)
        .bind(field)
        .fetch_optional(&mut *db)
        .await
}

async fn apply(db: &mut SqliteConnection, op: &Op) -> Result<i64, sqlx::Error> {
    match op {
        Op::ListPushLeft { key, value } => push(db, key, value, End::Left).await,
        Op::ListRemove { key, value, count } => remove(db, key, value, *count).await,
        Op::ListMoveValue { src, dst, value } => {
            if remove(&mut *db, src, value, 1).await? == 1 {
                push(db, dst, value, End::Left).await?;
                Ok(1)
            } else {
                Ok(0)
            }
        }
        Op::HashSet { key, field, value } => {
            let existed = hash_field(&mut *db, key, field).await?.is_some();

            sqlx::query(
                "
                INSERT INTO hash_fields (key, field, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (key, field) DO UPDATE SET value = excluded.value
                ",
            )
            .bind(key)
            .bind(field)
            .bind(value.as_ref())
            .execute(&mut *db)
            .await?;

            Ok(if existed { 0 } else { 1 })
        }
        Op::HashDeleteField { key, field } => {
            let result = sqlx::query("DELETE FROM hash_fields WHERE key = $1 AND field = $2")
                .bind(key)
                .bind(field)
                .execute(&mut *db)
                .await?;
            Ok(result.rows_affected() as i64)
        }
        Op::HashDelete { key } => {
            let result = sqlx::query("DELETE FROM hash_fields WHERE key = $1")
                .bind(key)
                .execute(&mut *db)
                .await?;
            Ok((result.rows_affected() > 0) as i64)
        }
        Op::SortedSetAdd { key, score, member } => {
            let existed: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM sorted_set_members WHERE key = $1 AND member = $2",
            )
            .bind(key)
            .bind(member)
            .fetch_optional(&mut *db)
            .await?;

            sqlx::query(
                "
                INSERT INTO sorted_set_members (key, member, score)
                VALUES ($1, $2, $3)
                ON CONFLICT (key, member) DO UPDATE SET score = excluded.score
                ",
            )
            .bind(key)
            .bind(member)
            .bind(*score)
            .execute(&mut *db)
            .await?;

            Ok(if existed.is_some() { 0 } else { 1 })
        }
        Op::SortedSetRemove { key, member } => {
            let result =
                sqlx::query("DELETE FROM sorted_set_members WHERE key = $1 AND member = $2")
                    .bind(key)
                    .bind(member)
                    .execute(&mut *db)
                    .await?;
            Ok(result.rows_affected() as i64)
        }
    }
}

impl Store for SqliteStore {
    fn atomic_batch<'a>(&'a self, ops: Vec<Op>) -> StoreFuture<'a, Vec<i64>> {
        Box::pin(async move {
            let mut tx = self.db.begin().await?;

            let mut replies = Vec::with_capacity(ops.len());
            for op in &ops {
                replies.push(apply(&mut tx, op).await?);
            }

            tx.commit().await?;

            Ok(replies)
        })
    }

    fn atomic_batch_if<'a>(
        &'a self,
        guard: Guard,
        ops: Vec<Op>,
    ) -> StoreFuture<'a, Option<Vec<i64>>> {
        Box::pin(async move {
            let mut tx = self.db.begin().await?;

            let Guard::HashFieldEquals { key, field, value } = &guard;
            let current = hash_field(&mut tx, key, field).await?;
            if current.as_deref() != value.as_deref() {
                return Ok(None);
            }

            let mut replies = Vec::with_capacity(ops.len());
            for op in &ops {
                replies.push(apply(&mut tx, op).await?);
            }

            tx.commit().await?;

            Ok(Some(replies))
        })
    }

    fn list_move<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        from: End,
        to: End,
    ) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut tx = self.db.begin().await?;

            let sql = match from {
                End::Left => {
                    "SELECT seq, value FROM list_entries WHERE key = $1 ORDER BY seq ASC LIMIT 1"
                }
                End::Right => {
                    "SELECT seq, value FROM list_entries WHERE key = $1 ORDER BY seq DESC LIMIT 1"
                }
            };
            let head: Option<(i64, String)> = sqlx::query_as(sql)
                .bind(src)
                .fetch_optional(&mut *tx)
                .await?;

            let Some((seq, value)) = head else {
                return Ok(None);
            };

            sqlx::query("DELETE FROM list_entries WHERE key = $1 AND seq = $2")
                .bind(src)
                .bind(seq)
                .execute(&mut *tx)
                .await?;
            push(&mut tx, dst, &value, to).await?;

            tx.commit().await?;

            Ok(Some(value))
        })
    }

    fn list_range<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut stream =
                sqlx::query_scalar::<_, String>("SELECT value FROM list_entries WHERE key = $1 ORDER BY seq")
                    .bind(key)
                    .fetch(&self.db);

            let mut values = Vec::new();

            while let Some(value) = stream.next().await.transpose()? {
                values.push(value);
            }

            Ok(values)
        })
    }

    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM list_entries WHERE key = $1")
                .bind(key)
                .fetch_one(&self.db)
                .await?;
            Ok(len as u64)
        })
    }

    fn hash_get<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let mut conn = self.db.acquire().await?;
            Ok(hash_field(&mut conn, key, field).await?.map(Bytes::from))
        })
    }

    fn hash_get_all<'a>(&'a self, key: &'a str) -> StoreFuture<'a, HashMap<String, Bytes>> {
        Box::pin(async move {
            let mut stream = sqlx::query_as::<_, (String, Vec<u8>)>(
                "SELECT field, value FROM hash_fields WHERE key = $1",
            )
            .bind(key)
            .fetch(&self.db);

            let mut fields = HashMap::new();

            while let Some((field, value)) = stream.next().await.transpose()? {
                fields.insert(field, Bytes::from(value));
            }

            Ok(fields)
        })
    }

    fn sorted_set_range_by_score<'a>(
        &'a self,
        key: &'a str,
        max: f64,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut stream = sqlx::query_scalar::<_, String>(
                "
                SELECT member FROM sorted_set_members
                WHERE key = $1 AND score <= $2
                ORDER BY score ASC, member ASC
                ",
            )
            .bind(key)
            .bind(max)
            .fetch(&self.db);

            let mut members = Vec::new();

            while let Some(member) = stream.next().await.transpose()? {
                members.push(member);
            }

            Ok(members)
        })
    }

    fn close<'a>(&'a self) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.db.close().await;
            Ok(())
        })
    }
}
