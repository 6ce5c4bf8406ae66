#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use leasemq::{
    config::Config,
    message::generate_id,
    queue::QueueOptions,
    store::{End, Guard, MemoryStore, Op, Store, StoreFuture},
    Error, MessageQueue,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Queue name that no other test shares.
pub fn unique(name: &str) -> String {
    format!("{name}-{}", generate_id())
}

pub fn options() -> QueueOptions {
    QueueOptions {
        default_visibility: TIMEOUT,
        max_retries: 3,
        dead_letter_queue: unique("dead-letter"),
        reaper_interval: Duration::from_millis(10),
        reaper_grace: Duration::from_secs(30),
    }
}

pub fn memory_queue() -> MessageQueue {
    MessageQueue::new(Arc::new(MemoryStore::new()), options())
}

/// Memory store that yields to the scheduler before every call, so
/// concurrent callers interleave, and that can slip writes in right before
/// the next guarded batch.
#[derive(Default)]
pub struct InterleavingStore {
    inner: MemoryStore,
    before_guarded: Mutex<Vec<Op>>,
}

impl InterleavingStore {
    /// Applies `ops` just before the next `atomic_batch_if` is evaluated.
    pub fn interfere(&self, ops: Vec<Op>) {
        self.before_guarded.lock().unwrap().extend(ops);
    }
}

impl Store for InterleavingStore {
    fn atomic_batch<'a>(&'a self, ops: Vec<Op>) -> StoreFuture<'a, Vec<i64>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.atomic_batch(ops).await
        })
    }

    fn atomic_batch_if<'a>(
        &'a self,
        guard: Guard,
        ops: Vec<Op>,
    ) -> StoreFuture<'a, Option<Vec<i64>>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let pending = std::mem::take(&mut *self.before_guarded.lock().unwrap());
            if !pending.is_empty() {
                self.inner.atomic_batch(pending).await?;
            }
            self.inner.atomic_batch_if(guard, ops).await
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
            tokio::task::yield_now().await;
            self.inner.list_move(src, dst, from, to).await
        })
    }

    fn list_range<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.list_range(key).await
        })
    }

    fn list_len<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.list_len(key).await
        })
    }

    fn hash_get<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.hash_get(key, field).await
        })
    }

    fn hash_get_all<'a>(&'a self, key: &'a str) -> StoreFuture<'a, HashMap<String, Bytes>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.hash_get_all(key).await
        })
    }

    fn sorted_set_range_by_score<'a>(
        &'a self,
        key: &'a str,
        max: f64,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.sorted_set_range_by_score(key, max).await
        })
    }

    fn close<'a>(&'a self) -> StoreFuture<'a, ()> {
        self.inner.close()
    }
}

/// Queue over an [`InterleavingStore`], returned alongside the store.
pub fn interleaving_queue() -> (MessageQueue, Arc<InterleavingStore>) {
    let store = Arc::new(InterleavingStore::default());
    let queue = MessageQueue::new(Arc::clone(&store) as Arc<dyn Store>, options());
    (queue, store)
}

pub async fn memory_queue_from(config: Config) -> MessageQueue {
    MessageQueue::connect_with()
        .config(config)
        .store(Arc::new(MemoryStore::new()) as Arc<dyn Store>)
        .call()
        .await
        .unwrap()
}

/// A moment after every lease taken with [`TIMEOUT`] has expired.
pub fn after_timeout() -> chrono::DateTime<Utc> {
    Utc::now() + TimeDelta::from_std(TIMEOUT).unwrap() + TimeDelta::seconds(1)
}

pub async fn push_then_pull_returns_payload(queue: &MessageQueue) {
    let name = unique("tasks");

    let id = queue.push(&name, &b"\x00binary\xffpayload"[..]).await.unwrap();
    let message = queue.pull(&name, TIMEOUT).await.unwrap();

    assert_eq!(message.id, id);
    assert_eq!(message.queue, name);
    assert_eq!(&message.payload[..], b"\x00binary\xffpayload");
    assert_eq!(message.retry_count, 1);

    let lease = message.lease.as_ref().unwrap();
    assert_eq!(lease.leased_from, name);
    assert!(lease.expires_at > Utc::now());
}

pub async fn pull_on_empty_queue(queue: &MessageQueue) {
    let name = unique("empty");

    let err = queue.pull(&name, TIMEOUT).await.unwrap_err();
    assert!(err.is_queue_empty(), "{err}");

    queue.push(&name, "only").await.unwrap();
    queue.pull(&name, TIMEOUT).await.unwrap();

    let err = queue.pull(&name, TIMEOUT).await.unwrap_err();
    assert!(err.is_queue_empty(), "{err}");
}

pub async fn pull_is_fifo(queue: &MessageQueue) {
    let name = unique("fifo");

    let mut pushed = Vec::new();
    for i in 0..5 {
        pushed.push(queue.push(&name, format!("message {i}")).await.unwrap());
    }

    let mut pulled = Vec::new();
    for _ in 0..5 {
        pulled.push(queue.pull(&name, TIMEOUT).await.unwrap().id);
    }

    assert_eq!(pulled, pushed);
}

pub async fn ack_deletes_message(queue: &MessageQueue) {
    let name = unique("ack");

    let id = queue.push(&name, "done soon").await.unwrap();
    let message = queue.pull(&name, TIMEOUT).await.unwrap();
    let receipt = message.receipt().unwrap();

    queue.ack(&id, receipt).await.unwrap();

    let err = queue.ack(&id, receipt).await.unwrap_err();
    assert!(matches!(err, Error::MessageNotFound { .. }), "{err}");

    let stats = queue.stats(&name).await.unwrap();
    assert_eq!((stats.available, stats.in_flight), (0, 0));
}

pub async fn wrong_receipt_keeps_lease(queue: &MessageQueue) {
    let name = unique("receipt");

    let id = queue.push(&name, "guarded").await.unwrap();
    let message = queue.pull(&name, TIMEOUT).await.unwrap();

    let err = queue.ack(&id, "not-the-receipt").await.unwrap_err();
    assert!(matches!(err, Error::InvalidReceipt { .. }), "{err}");

    assert_eq!(queue.stats(&name).await.unwrap().in_flight, 1);

    queue.ack(&id, message.receipt().unwrap()).await.unwrap();
}

pub async fn ack_before_pull_is_not_found(queue: &MessageQueue) {
    let name = unique("unpulled");

    let id = queue.push(&name, "waiting").await.unwrap();

    let err = queue.ack(&id, "anything").await.unwrap_err();
    assert!(matches!(err, Error::MessageNotFound { .. }), "{err}");

    let err = queue.ack(&generate_id(), "anything").await.unwrap_err();
    assert!(matches!(err, Error::MessageNotFound { .. }), "{err}");

    assert_eq!(queue.stats(&name).await.unwrap().available, 1);
}

pub async fn order_scenario(queue: &MessageQueue) {
    let name = unique("orders");

    let id = queue.push(&name, "order-1").await.unwrap();

    let message = queue.pull(&name, TIMEOUT).await.unwrap();
    assert_eq!(&message.payload[..], b"order-1");
    assert_eq!(message.retry_count, 1);

    queue.ack(&id, message.receipt().unwrap()).await.unwrap();

    let err = queue.pull(&name, TIMEOUT).await.unwrap_err();
    assert!(err.is_queue_empty(), "{err}");
}

pub async fn expired_lease_is_redelivered(queue: &MessageQueue) {
    let name = unique("redeliver");

    let id = queue.push(&name, "again").await.unwrap();
    let first = queue.pull(&name, TIMEOUT).await.unwrap();

    queue.reaper().run_once_at(after_timeout()).await;

    let stats = queue.stats(&name).await.unwrap();
    assert_eq!((stats.available, stats.in_flight), (1, 0));

    let second = queue.pull(&name, TIMEOUT).await.unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.retry_count, 2);
    assert_ne!(second.receipt(), first.receipt());

    let err = queue.ack(&id, first.receipt().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidReceipt { .. }), "{err}");

    queue.ack(&id, second.receipt().unwrap()).await.unwrap();
}

pub async fn exhausted_message_is_dead_lettered(queue: &MessageQueue) {
    let name = unique("poison");
    let dead_letter = queue.options().dead_letter_queue.clone();
    let max_retries = queue.options().max_retries;

    let id = queue.push(&name, "poison").await.unwrap();

    for _ in 0..max_retries {
        queue.pull(&name, TIMEOUT).await.unwrap();
        queue.reaper().run_once_at(after_timeout()).await;
    }

    let err = queue.pull(&name, TIMEOUT).await.unwrap_err();
    assert!(err.is_queue_empty(), "{err}");

    let message = queue.pull(&dead_letter, TIMEOUT).await.unwrap();
    assert_eq!(message.id, id);
    assert_eq!(message.queue, name);
    assert_eq!(message.retry_count, max_retries + 1);

    assert!(queue.list_queues().await.unwrap().contains(&dead_letter));

    queue.ack(&id, message.receipt().unwrap()).await.unwrap();
}
