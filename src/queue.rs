//! Queue protocol engine.
//!
//! Push, lease-based pull and receipt-checked acknowledgement on top of any
//! [`Store`]. The engine holds no locks of its own: every state transition is
//! a single atomic batch in the store, and the engine is the only writer of
//! message records.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::{Backend, Config},
    error::{Error, StoreError},
    keys,
    message::{self, field, generate_id, Lease, Message},
    reaper::{Reaper, ReaperHandle},
    store::{End, Guard, MemoryStore, Op, RedisStore, SqliteStore, Store},
};

/// Protocol settings taken from [`Config`].
#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub default_visibility: Duration,
    pub max_retries: u32,
    pub dead_letter_queue: String,
    pub reaper_interval: Duration,
    pub reaper_grace: Duration,
}

impl From<&Config> for QueueOptions {
    fn from(config: &Config) -> Self {
        Self {
            default_visibility: config.default_visibility(),
            max_retries: config.max_retries,
            dead_letter_queue: config.dead_letter_queue.clone(),
            reaper_interval: config.reaper_interval(),
            reaper_grace: config.reaper_grace(),
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Depth of one queue at a point in time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: String,
    /// Messages waiting to be pulled
    pub available: u64,
    /// Messages currently leased to a consumer
    pub in_flight: u64,
}

/// Handle to the queue protocol. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct MessageQueue {
    store: Arc<dyn Store>,
    options: QueueOptions,
}

/// Opens the backend selected by `config.backend`.
pub async fn connect_store(config: &Config) -> Result<Arc<dyn Store>, StoreError> {
    Ok(match config.backend {
        Backend::Redis => Arc::new(RedisStore::connect(config).await?),
        Backend::Sqlite => Arc::new(SqliteStore::connect(Some(config.db_path())).await?),
        Backend::Memory => Arc::new(MemoryStore::new()),
    })
}

#[bon::bon]
impl MessageQueue {
    /// Connects to the configured backend, or wraps `store` when one is given.
    #[builder]
    pub async fn connect_with(config: Config, store: Option<Arc<dyn Store>>) -> Result<Self, Error> {
        let store = match store {
            Some(store) => store,
            None => connect_store(&config).await?,
        };

        Ok(Self::new(store, QueueOptions::from(&config)))
    }
}

impl MessageQueue {
    pub fn new(store: Arc<dyn Store>, options: QueueOptions) -> Self {
        Self { store, options }
    }

    /// Connects using configuration read from the environment.
    pub async fn connect() -> eyre::Result<Self> {
        Ok(Self::connect_with()
            .config(Config::load()?)
            .call()
            .await?)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Stores a new message and makes it available on `queue`. Returns its id.
    pub async fn push(&self, queue: &str, payload: impl Into<Bytes>) -> Result<String, Error> {
        check_queue_name(queue)?;

        let message = Message::new(queue, payload);
        let key = keys::message(&message.id);

        let mut ops: Vec<Op> = message
            .record_fields()?
            .into_iter()
            .map(|(field, value)| Op::HashSet {
                key: key.clone(),
                field: field.to_owned(),
                value,
            })
            .collect();
        ops.push(Op::ListPushLeft {
            key: keys::available(queue),
            value: message.id.clone(),
        });
        ops.push(Op::SortedSetAdd {
            key: keys::QUEUES.to_owned(),
            score: message::score(message.created_at),
            member: queue.to_owned(),
        });

        self.store.atomic_batch(ops).await?;

        debug!(queue, id = %message.id, bytes = message.payload.len(), "pushed message");

        Ok(message.id)
    }

    /// Leases the oldest available message on `queue` for `visibility_timeout`.
    ///
    /// Returns [`Error::QueueEmpty`] when nothing is available. The returned
    /// message carries the receipt that [`MessageQueue::ack`] expects.
    pub async fn pull(&self, queue: &str, visibility_timeout: Duration) -> Result<Message, Error> {
        check_queue_name(queue)?;

        let timeout = TimeDelta::from_std(visibility_timeout).map_err(|_| {
            Error::invalid_parameter(format!("visibility timeout {visibility_timeout:?}"))
        })?;
        let expires_at = Utc::now().checked_add_signed(timeout).ok_or_else(|| {
            Error::invalid_parameter(format!("visibility timeout {visibility_timeout:?}"))
        })?;

        let in_flight = keys::in_flight(queue);
        let Some(id) = self
            .store
            .list_move(&keys::available(queue), &in_flight, End::Right, End::Left)
            .await?
        else {
            return Err(Error::QueueEmpty);
        };

        let key = keys::message(&id);
        let mut message = match Message::from_record(&id, self.store.hash_get_all(&key).await?)? {
            Some(message) => message,
            None => {
                warn!(queue, %id, "listed message has no record");
                return Err(Error::message_not_found(id));
            }
        };

        let lease = Lease {
            receipt: generate_id(),
            expires_at,
            leased_from: queue.to_owned(),
        };
        message.retry_count = message.retry_count.saturating_add(1);

        let mut ops: Vec<Op> = lease
            .fields()
            .into_iter()
            .map(|(field, value)| Op::HashSet {
                key: key.clone(),
                field: field.to_owned(),
                value,
            })
            .collect();
        ops.push(Op::HashSet {
            key: key.clone(),
            field: field::RETRY_COUNT.to_owned(),
            value: message::retry_count_value(message.retry_count),
        });
        ops.push(Op::SortedSetAdd {
            key: keys::VISIBILITY.to_owned(),
            score: message::score(expires_at),
            member: keys::expiry_member(queue, &id),
        });

        // The id is already in-flight at this point. If this batch fails it
        // stays there without a lease until the reaper's grace period expires
        // and hands it back.
        self.store.atomic_batch(ops).await?;

        debug!(
            queue,
            %id,
            retry_count = message.retry_count,
            expires_at = %expires_at,
            "leased message"
        );

        message.lease = Some(lease);
        Ok(message)
    }

    /// [`MessageQueue::pull`] with the configured default visibility timeout.
    pub async fn pull_default(&self, queue: &str) -> Result<Message, Error> {
        self.pull(queue, self.options.default_visibility).await
    }

    /// Acknowledges a leased message, deleting it permanently.
    ///
    /// Fails with [`Error::MessageNotFound`] when the message has no lease
    /// (already acknowledged, or never pulled) and with
    /// [`Error::InvalidReceipt`] when the lease now belongs to someone else.
    pub async fn ack(&self, id: &str, receipt: &str) -> Result<(), Error> {
        let key = keys::message(id);

        let lease = Message::from_record(id, self.store.hash_get_all(&key).await?)?
            .and_then(|message| message.lease)
            .ok_or_else(|| Error::message_not_found(id))?;

        if lease.receipt.as_bytes() != receipt.as_bytes() {
            return Err(Error::invalid_receipt(id));
        }

        let guard = Guard::HashFieldEquals {
            key: key.clone(),
            field: field::RECEIPT.to_owned(),
            value: Some(Bytes::copy_from_slice(receipt.as_bytes())),
        };
        let ops = vec![
            Op::ListRemove {
                key: keys::in_flight(&lease.leased_from),
                value: id.to_owned(),
                count: 1,
            },
            Op::SortedSetRemove {
                key: keys::VISIBILITY.to_owned(),
                member: keys::expiry_member(&lease.leased_from, id),
            },
            Op::HashDelete { key: key.clone() },
        ];

        if self.store.atomic_batch_if(guard, ops).await?.is_none() {
            // The lease changed between the receipt check and the delete.
            return match self.store.hash_get(&key, field::META).await? {
                Some(_) => Err(Error::invalid_receipt(id)),
                None => Err(Error::message_not_found(id)),
            };
        }

        debug!(queue = %lease.leased_from, %id, "acknowledged message");

        Ok(())
    }

    /// Names of every queue that has received a message.
    pub async fn list_queues(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .store
            .sorted_set_range_by_score(keys::QUEUES, f64::INFINITY)
            .await?)
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, Error> {
        Ok(QueueStats {
            queue: queue.to_owned(),
            available: self.store.list_len(&keys::available(queue)).await?,
            in_flight: self.store.list_len(&keys::in_flight(queue)).await?,
        })
    }

    /// Reaper bound to this queue's store and options.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(Arc::clone(&self.store), &self.options)
    }

    /// Starts the reaper as a background task.
    pub fn spawn_reaper(&self) -> ReaperHandle {
        self.reaper().spawn()
    }

    /// Releases the store. Consumes the handle so no further calls can be made
    /// through it.
    pub async fn close(self) -> Result<(), Error> {
        self.store.close().await?;
        Ok(())
    }
}

fn check_queue_name(queue: &str) -> Result<(), Error> {
    if queue.is_empty() {
        return Err(Error::invalid_parameter("queue name must not be empty"));
    }
    Ok(())
}
