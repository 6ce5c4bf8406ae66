//! Redis implementation of the store capability set.
//!
//! Unguarded batches run as a `MULTI`/`EXEC` pipeline. Conditional work
//! (guarded batches and [`Op::ListMoveValue`]) runs server-side in Lua so the
//! check and the writes cannot interleave with another client.

use std::{collections::HashMap, time::Duration};

use ::redis::{aio::ConnectionManager, Client, Pipeline, Script, Value};
use bytes::Bytes;
use secrecy::ExposeSecret;
use url::Url;

use crate::{config::Config, error::StoreError};

use super::{End, Guard, Op, Store, StoreFuture};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Queued inside `MULTI` as a plain `EVAL`: `KEYS[1]` source list,
/// `KEYS[2]` destination list, `ARGV[1]` value.
const MOVE_VALUE: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
";

/// Guarded batch interpreter.
///
/// `ARGV[1..4]` describe the guard: hash key, field, `1` if a value is
/// expected (`0` for "absent"), expected value. The remaining arguments are a
/// flat sequence of encoded ops, see [`encode`].
const GUARDED_BATCH: &str = r"
local current = redis.call('HGET', ARGV[1], ARGV[2])
if ARGV[3] == '1' then
    if current ~= ARGV[4] then return false end
elseif current then
    return false
end

local replies = {}
local i = 5
while i <= #ARGV do
    local op = ARGV[i]
    if op == 'LPUSH' then
        table.insert(replies, redis.call('LPUSH', ARGV[i + 1], ARGV[i + 2]))
        i = i + 3
    elseif op == 'LREM' then
        table.insert(replies, redis.call('LREM', ARGV[i + 1], ARGV[i + 2], ARGV[i + 3]))
        i = i + 4
    elseif op == 'LMOVEVALUE' then
        if redis.call('LREM', ARGV[i + 1], 1, ARGV[i + 3]) == 1 then
            redis.call('LPUSH', ARGV[i + 2], ARGV[i + 3])
            table.insert(replies, 1)
        else
            table.insert(replies, 0)
        end
        i = i + 4
    elseif op == 'HSET' then
        table.insert(replies, redis.call('HSET', ARGV[i + 1], ARGV[i + 2], ARGV[i + 3]))
        i = i + 4
    elseif op == 'HDEL' then
        table.insert(replies, redis.call('HDEL', ARGV[i + 1], ARGV[i + 2]))
        i = i + 3
    elseif op == 'DEL' then
        table.insert(replies, redis.call('DEL', ARGV[i + 1]))
        i = i + 2
    elseif op == 'ZADD' then
        table.insert(replies, redis.call('ZADD', ARGV[i + 1], ARGV[i + 2], ARGV[i + 3]))
        i = i + 4
    elseif op == 'ZREM' then
        table.insert(replies, redis.call('ZREM', ARGV[i + 1], ARGV[i + 2]))
        i = i + 3
    else
        return redis.error_reply('unknown op ' .. tostring(op))
    end
end
return replies
";

/// Store backed by a Redis server.
///
/// Holds a [`ConnectionManager`], which multiplexes every caller over one
/// reconnecting connection and is cheap to clone per call.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    guarded_batch: Script,
}

impl RedisStore {
    /// Connects using the address, password and database index from `config`
    /// and verifies the server answers a `PING`.
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let url = connection_url(config)?;
        let client = Client::open(url.as_str())?;

        let address = config.redis_addr.clone();
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let mut conn = client.get_connection_manager().await?;
            let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|_| StoreError::ConnectTimeout { address })??;

        tracing::debug!(addr = %config.redis_addr, db = config.redis_db, "connected to redis");

        Ok(Self {
            conn,
            guarded_batch: Script::new(GUARDED_BATCH),
        })
    }

    fn pipe_op(&self, pipe: &mut Pipeline, op: &Op) {
        match op {
            Op::ListPushLeft { key, value } => {
                pipe.cmd("LPUSH").arg(key).arg(value);
            }
            Op::ListRemove { key, value, count } => {
                pipe.cmd("LREM").arg(key).arg(*count).arg(value);
            }
            Op::ListMoveValue { src, dst, value } => {
                pipe.cmd("EVAL")
                    .arg(MOVE_VALUE)
                    .arg(2)
                    .arg(src)
                    .arg(dst)
                    .arg(value);
            }
            Op::HashSet { key, field, value } => {
                pipe.cmd("HSET").arg(key).arg(field).arg(value.as_ref());
            }
            Op::HashDeleteField { key, field } => {
                pipe.cmd("HDEL").arg(key).arg(field);
            }
            Op::HashDelete { key } => {
                pipe.cmd("DEL").arg(key);
            }
            Op::SortedSetAdd { key, score, member } => {
                pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
            }
            Op::SortedSetRemove { key, member } => {
                pipe.cmd("ZREM").arg(key).arg(member);
            }
        }
    }
}

/// Builds `redis://[:password@]host:port/db` from the configured parts.
fn connection_url(config: &Config) -> Result<Url, StoreError> {
    let address = config.redis_addr.as_str();
    let invalid = |source| StoreError::InvalidAddress {
        address: address.to_owned(),
        source,
    };

    let mut url = Url::parse(&format!("redis://{address}")).map_err(invalid)?;
    if let Some(password) = &config.redis_password {
        url.set_password(Some(password.expose_secret()))
            .map_err(|_| invalid(url::ParseError::EmptyHost))?;
    }
    url.set_path(&format!("/{}", config.redis_db));

    Ok(url)
}

/// Flattens an op into the argument encoding understood by [`GUARDED_BATCH`].
fn encode(op: &Op, args: &mut Vec<Vec<u8>>) {
    let mut push = |part: &[u8]| args.push(part.to_vec());
    match op {
        Op::ListPushLeft { key, value } => {
            push(b"LPUSH");
            push(key.as_bytes());
            push(value.as_bytes());
        }
        Op::ListRemove { key, value, count } => {
            push(b"LREM");
            push(key.as_bytes());
            push(count.to_string().as_bytes());
            push(value.as_bytes());
        }
        Op::ListMoveValue { src, dst, value } => {
            push(b"LMOVEVALUE");
            push(src.as_bytes());
            push(dst.as_bytes());
            push(value.as_bytes());
        }
        Op::HashSet { key, field, value } => {
            push(b"HSET");
            push(key.as_bytes());
            push(field.as_bytes());
            push(value.as_ref());
        }
        Op::HashDeleteField { key, field } => {
            push(b"HDEL");
            push(key.as_bytes());
            push(field.as_bytes());
        }
        Op::HashDelete { key } => {
            push(b"DEL");
            push(key.as_bytes());
        }
        Op::SortedSetAdd { key, score, member } => {
            push(b"ZADD");
            push(key.as_bytes());
            push(score.to_string().as_bytes());
            push(member.as_bytes());
        }
        Op::SortedSetRemove { key, member } => {
            push(b"ZREM");
            push(key.as_bytes());
            push(member.as_bytes());
        }
    }
}

fn integer_replies(value: Value) -> Vec<i64> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Int(n) => n,
                _ => 0,
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl Store for RedisStore {
    fn atomic_batch<'a>(&'a self, ops: Vec<Op>) -> StoreFuture<'a, Vec<i64>> {
        Box::pin(async move {
            if ops.is_empty() {
                return Ok(Vec::new());
            }

            let mut pipe = ::redis::pipe();
            pipe.atomic();
            for op in &ops {
                self.pipe_op(&mut pipe, op);
            }

            let mut conn = self.conn.clone();
            let replies: Vec<i64> = pipe.query_async(&mut conn).await?;
            Ok(replies)
        })
    }

    fn atomic_batch_if<'a>(
        &'a self,
        guard: Guard,
        ops: Vec<Op>,
    ) -> StoreFuture<'a, Option<Vec<i64>>> {
        Box::pin(async move {
            let Guard::HashFieldEquals { key, field, value } = guard;

            let mut invocation = self.guarded_batch.prepare_invoke();
            invocation.arg(key).arg(field);
            match &value {
                Some(expected) => invocation.arg("1").arg(expected.as_ref()),
                None => invocation.arg("0").arg(""),
            };

            let mut args = Vec::new();
            for op in &ops {
                encode(op, &mut args);
            }
            for arg in args {
                invocation.arg(arg);
            }

            let mut conn = self.conn.clone();
            let reply: Value = invocation.invoke_async(&mut conn).await?;

            Ok(match reply {
                Value::Nil => None,
                other => Some(integer_replies(other)),
            })
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
            let mut conn = self.conn.clone();
            let value: Option<String> = ::redis::cmd("LMOVE")
                .arg(src)
                .arg(dst)
                .arg(from.as_str())
                .arg(to.as_str())
                .query_async(&mut conn)
                .await?;
            Ok(value)
        })
    }

    fn list_range<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let values: Vec<String> = ::redis::cmd("LRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
            Ok(values)
        })
    }

    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let len: u64 = ::redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
            Ok(len)
        })
    }

    fn hash_get<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<Vec<u8>> = ::redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query_async(&mut conn)
                .await?;
            Ok(value.map(Bytes::from))
        })
    }

    fn hash_get_all<'a>(&'a self, key: &'a str) -> StoreFuture<'a, HashMap<String, Bytes>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let fields: HashMap<String, Vec<u8>> = ::redis::cmd("HGETALL")
                .arg(key)
                .query_async(&mut conn)
                .await?;
            Ok(fields
                .into_iter()
                .map(|(field, value)| (field, Bytes::from(value)))
                .collect())
        })
    }

    fn sorted_set_range_by_score<'a>(
        &'a self,
        key: &'a str,
        max: f64,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let max = if max.is_infinite() && max.is_sign_positive() {
                "+inf".to_owned()
            } else {
                max.to_string()
            };

            let mut conn = self.conn.clone();
            let members: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max)
                .query_async(&mut conn)
                .await?;
            Ok(members)
        })
    }

    fn close<'a>(&'a self) -> StoreFuture<'a, ()> {
        // The connection manager closes its socket once the last clone drops.
        Box::pin(async move {
            tracing::debug!("closing redis store");
            Ok(())
        })
    }
}
