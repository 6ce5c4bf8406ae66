//! Atomic store adapter.
//!
//! The queue protocol only needs a handful of list, hash and sorted-set
//! primitives from its backing store, plus the ability to apply several of
//! them as one indivisible unit. This module defines that capability set as
//! the [`Store`] trait so the protocol can run against Redis in production,
//! SQLite on a single host, or an in-process map in tests.
//!
//! Backends never retry. A transport failure is reported as-is and the caller
//! decides what to do with it.

use std::{collections::HashMap, future::Future, pin::Pin};

use bytes::Bytes;

use crate::error::StoreError;

pub mod memory;
pub mod redis;
pub mod sqlite;

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use sqlite::SqliteStore;

/// Boxed future returned by every [`Store`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// End of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Left,
    Right,
}

impl End {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
        }
    }
}

/// A single write inside an atomic batch.
///
/// Every op yields one integer reply, following the Redis command it mirrors.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Reply: list length after the push.
    ListPushLeft { key: String, value: String },
    /// `count > 0` removes from the head, `count < 0` from the tail, `0`
    /// removes every occurrence. Reply: number removed.
    ListRemove {
        key: String,
        value: String,
        count: i64,
    },
    /// Remove one occurrence of `value` from `src` and, only if one was
    /// found, push it on the left of `dst`. Reply: 1 if moved, 0 otherwise.
    ListMoveValue {
        src: String,
        dst: String,
        value: String,
    },
    /// Reply: 1 if the field is new, 0 if it was overwritten.
    HashSet {
        key: String,
        field: String,
        value: Bytes,
    },
    /// Reply: 1 if the field existed.
    HashDeleteField { key: String, field: String },
    /// Reply: 1 if the hash existed.
    HashDelete { key: String },
    /// Inserts or rescores `member`. Reply: 1 if the member is new.
    SortedSetAdd {
        key: String,
        score: f64,
        member: String,
    },
    /// Reply: 1 if the member existed.
    SortedSetRemove { key: String, member: String },
}

/// Precondition evaluated atomically with a guarded batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Holds when the hash field currently has `value`; `None` requires the
    /// field (or the whole hash) to be absent.
    HashFieldEquals {
        key: String,
        field: String,
        value: Option<Bytes>,
    },
}

/// Capability set the queue protocol needs from its backing store.
///
/// Implementations must be safe to share between any number of concurrent
/// callers.
pub trait Store: Send + Sync + 'static {
    /// Applies `ops` in order as one indivisible unit and returns one reply
    /// per op. Either every op takes effect or none does.
    fn atomic_batch<'a>(&'a self, ops: Vec<Op>) -> StoreFuture<'a, Vec<i64>>;

    /// Like [`Store::atomic_batch`], but only when `guard` holds at the
    /// moment the batch executes. Returns `None` without applying anything
    /// when the guard fails.
    fn atomic_batch_if<'a>(&'a self, guard: Guard, ops: Vec<Op>)
        -> StoreFuture<'a, Option<Vec<i64>>>;

    /// Atomically pops a value from one end of `src` and pushes it onto one
    /// end of `dst`. Returns `None` when `src` is empty.
    fn list_move<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
        from: End,
        to: End,
    ) -> StoreFuture<'a, Option<String>>;

    /// Every element of the list, left to right.
    fn list_range<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>>;

    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    fn hash_get<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<Bytes>>;

    /// All fields of the hash; empty when the hash does not exist.
    fn hash_get_all<'a>(&'a self, key: &'a str) -> StoreFuture<'a, HashMap<String, Bytes>>;

    /// Members with a score `<= max`, lowest score first.
    fn sorted_set_range_by_score<'a>(
        &'a self,
        key: &'a str,
        max: f64,
    ) -> StoreFuture<'a, Vec<String>>;

    /// Releases the backend's resources. Further calls are not permitted.
    fn close<'a>(&'a self) -> StoreFuture<'a, ()>;

    fn list_push_left<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, i64> {
        single(
            self,
            Op::ListPushLeft {
                key: key.to_owned(),
                value: value.to_owned(),
            },
        )
    }

    fn list_remove<'a>(&'a self, key: &'a str, value: &'a str, count: i64) -> StoreFuture<'a, i64> {
        single(
            self,
            Op::ListRemove {
                key: key.to_owned(),
                value: value.to_owned(),
                count,
            },
        )
    }

    fn hash_set<'a>(&'a self, key: &'a str, field: &'a str, value: Bytes) -> StoreFuture<'a, i64> {
        single(
            self,
            Op::HashSet {
                key: key.to_owned(),
                field: field.to_owned(),
                value,
            },
        )
    }

    fn hash_delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        single(
            self,
            Op::HashDelete {
                key: key.to_owned(),
            },
        )
    }

    fn sorted_set_add<'a>(
        &'a self,
        key: &'a str,
        score: f64,
        member: &'a str,
    ) -> StoreFuture<'a, i64> {
        single(
            self,
            Op::SortedSetAdd {
                key: key.to_owned(),
                score,
                member: member.to_owned(),
            },
        )
    }

    fn sorted_set_remove<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, i64> {
        single(
            self,
            Op::SortedSetRemove {
                key: key.to_owned(),
                member: member.to_owned(),
            },
        )
    }
}

fn single<'a, S>(store: &'a S, op: Op) -> StoreFuture<'a, i64>
where
    S: Store + ?Sized,
{
    Box::pin(async move {
        let replies = store.atomic_batch(vec![op]).await?;
        Ok(replies.into_iter().next().unwrap_or_default())
    })
}
