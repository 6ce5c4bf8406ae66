//! Visibility reaper.
//!
//! Periodically returns messages whose lease has expired to their queue, or to
//! the dead-letter queue once they have been delivered `max_retries` times.
//! Every transition is guarded on the lease receipt the reaper observed, so
//! any number of reapers may run against the same store and a message that
//! was acknowledged or re-leased in the meantime is left alone.
//!
//! Each cycle also sweeps the in-flight list of every known queue for ids that
//! carry no lease. Those are left behind when a pull fails between taking the
//! id and recording the lease; once an id has been seen unleased for longer
//! than the grace period it is handed back to its queue. The sweep costs a
//! store round trip per in-flight id, so it runs at most once per half grace
//! period rather than on every cycle.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    keys,
    message::{self, field, Lease, Message},
    queue::QueueOptions,
    store::{Guard, Op, Store},
};

/// What one reaper cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    /// Expired leases returned to their queue
    pub requeued: u64,
    /// Expired leases moved to the dead-letter queue
    pub dead_lettered: u64,
    /// Expiry entries or in-flight ids whose record no longer exists
    pub orphaned: u64,
    /// Unleased in-flight ids handed back after the grace period
    pub recovered: u64,
}

impl ReapReport {
    pub fn total(&self) -> u64 {
        self.requeued + self.dead_lettered + self.orphaned + self.recovered
    }
}

enum Outcome {
    Requeued,
    DeadLettered,
    Orphaned,
    Skipped,
}

pub struct Reaper {
    store: Arc<dyn Store>,
    max_retries: u32,
    dead_letter_queue: String,
    interval: Duration,
    grace: TimeDelta,
    /// (queue, id) of unleased in-flight ids, with when they were first seen
    unleased: HashMap<(String, String), DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

/// Running reaper task.
pub struct ReaperHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops the task and waits for the cycle in progress, if any, to finish.
    pub async fn shutdown(self) {
        self.token.cancel();

        if let Err(e) = self.handle.await {
            warn!(error = %e, "reaper task failed");
        }
    }
}

impl Reaper {
    pub fn new(store: Arc<dyn Store>, options: &QueueOptions) -> Self {
        Self {
            store,
            max_retries: options.max_retries,
            dead_letter_queue: options.dead_letter_queue.clone(),
            interval: options.reaper_interval,
            grace: TimeDelta::from_std(options.reaper_grace).unwrap_or(TimeDelta::MAX),
            unleased: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Runs a cycle every reaper interval until the returned handle is shut down.
    pub fn spawn(mut self) -> ReaperHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }

            debug!("reaper stopped");
        });

        ReaperHandle { token, handle }
    }

    pub async fn run_once(&mut self) -> ReapReport {
        self.run_once_at(Utc::now()).await
    }

    /// Runs one cycle as if the current time were `now`.
    ///
    /// Failures are logged per entry and never abort the cycle.
    pub async fn run_once_at(&mut self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        let expired = match self
            .store
            .sorted_set_range_by_score(keys::VISIBILITY, message::score(now))
            .await
        {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "failed to scan expiry index");
                Vec::new()
            }
        };

        for member in expired {
            match self.reap_expired(&member, now).await {
                Ok(Outcome::Requeued) => report.requeued += 1,
                Ok(Outcome::DeadLettered) => report.dead_lettered += 1,
                Ok(Outcome::Orphaned) => report.orphaned += 1,
                Ok(Outcome::Skipped) => {}
                Err(e) => warn!(error = %e, %member, "failed to reap expired lease"),
            }
        }

        if self.sweep_due(now) {
            self.last_sweep = Some(now);
            self.sweep_unleased(now, &mut report).await;
        }

        if report.total() > 0 {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                orphaned = report.orphaned,
                recovered = report.recovered,
                "reaped expired leases"
            );
        }

        report
    }

    fn destination(&self, source: &str, message: &Message) -> String {
        if source == self.dead_letter_queue {
            return source.to_owned();
        }

        if message.retry_count >= self.max_retries {
            let reason = Error::MaxRetriesReached {
                id: message.id.clone(),
                retries: message.retry_count,
            };
            warn!(
                queue = source,
                dead_letter_queue = %self.dead_letter_queue,
                "{reason}"
            );
            return self.dead_letter_queue.clone();
        }

        source.to_owned()
    }

    async fn reap_expired(&self, member: &str, now: DateTime<Utc>) -> Result<Outcome, Error> {
        let Some((queue, id)) = keys::parse_expiry_member(member) else {
            warn!(%member, "dropping malformed expiry entry");
            self.store
                .sorted_set_remove(keys::VISIBILITY, member)
                .await?;
            return Ok(Outcome::Orphaned);
        };

        let key = keys::message(id);
        let record = Message::from_record(id, self.store.hash_get_all(&key).await?)?;

        let Some(message) = record else {
            self.store
                .atomic_batch(vec![
                    Op::SortedSetRemove {
                        key: keys::VISIBILITY.to_owned(),
                        member: member.to_owned(),
                    },
                    Op::ListRemove {
                        key: keys::in_flight(queue),
                        value: id.to_owned(),
                        count: 0,
                    },
                ])
                .await?;
            debug!(queue, id, "removed orphaned expiry entry");
            return Ok(Outcome::Orphaned);
        };

        let Some(lease) = &message.lease else {
            // Stale entry. A pull may be re-leasing the message under the
            // same member right now, so only drop it while still unleased.
            let guard = Guard::HashFieldEquals {
                key,
                field: field::RECEIPT.to_owned(),
                value: None,
            };
            let ops = vec![Op::SortedSetRemove {
                key: keys::VISIBILITY.to_owned(),
                member: member.to_owned(),
            }];
            return Ok(
                match self.store.atomic_batch_if(guard, ops).await?.as_deref() {
                    Some([1]) => Outcome::Orphaned,
                    _ => Outcome::Skipped,
                },
            );
        };

        if lease.expires_at > now {
            // Re-leased since the scan.
            return Ok(Outcome::Skipped);
        }

        let destination = self.destination(&lease.leased_from, &message);

        match self
            .store
            .atomic_batch_if(
                receipt_guard(&key, lease),
                self.release_ops(&key, id, lease, member, &destination, now),
            )
            .await?
        {
            None => {
                debug!(queue, id, "lease changed while reaping");
                Ok(Outcome::Skipped)
            }
            Some(_) if destination != lease.leased_from => {
                info!(queue, id, dead_letter_queue = %destination, "dead-lettered message");
                Ok(Outcome::DeadLettered)
            }
            Some(_) => {
                debug!(queue, id, retry_count = message.retry_count, "requeued message");
                Ok(Outcome::Requeued)
            }
        }
    }

    /// Ops that hand an expired message to `destination` and drop its lease.
    fn release_ops(
        &self,
        key: &str,
        id: &str,
        lease: &Lease,
        member: &str,
        destination: &str,
        now: DateTime<Utc>,
    ) -> Vec<Op> {
        let mut ops = vec![
            Op::ListRemove {
                key: keys::in_flight(&lease.leased_from),
                value: id.to_owned(),
                count: 0,
            },
            Op::ListPushLeft {
                key: keys::available(destination),
                value: id.to_owned(),
            },
        ];
        ops.extend(field::LEASE.iter().map(|field| Op::HashDeleteField {
            key: key.to_owned(),
            field: (*field).to_owned(),
        }));
        ops.push(Op::SortedSetRemove {
            key: keys::VISIBILITY.to_owned(),
            member: member.to_owned(),
        });
        if destination == self.dead_letter_queue {
            ops.push(register_queue(destination, now));
        }
        ops
    }

    fn sweep_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_sweep {
            Some(last) => now - last >= self.grace / 2,
            None => true,
        }
    }

    async fn sweep_unleased(&mut self, now: DateTime<Utc>, report: &mut ReapReport) {
        let queues = match self
            .store
            .sorted_set_range_by_score(keys::QUEUES, f64::INFINITY)
            .await
        {
            Ok(queues) => queues,
            Err(e) => {
                warn!(error = %e, "failed to list queues");
                return;
            }
        };

        let mut seen = HashSet::new();

        for queue in queues {
            let ids = match self.store.list_range(&keys::in_flight(&queue)).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, %queue, "failed to scan in-flight list");
                    continue;
                }
            };

            for id in ids {
                match self.check_unleased(&queue, &id, now, &mut seen).await {
                    Ok(Outcome::Requeued) => report.recovered += 1,
                    Ok(Outcome::Orphaned) => report.orphaned += 1,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, %queue, %id, "failed to check in-flight message"),
                }
            }
        }

        self.unleased.retain(|slot, _| seen.contains(slot));
    }

    async fn check_unleased(
        &mut self,
        queue: &str,
        id: &str,
        now: DateTime<Utc>,
        seen: &mut HashSet<(String, String)>,
    ) -> Result<Outcome, Error> {
        let key = keys::message(id);

        if self.store.hash_get(&key, field::RECEIPT).await?.is_some() {
            return Ok(Outcome::Skipped);
        }

        if self.store.hash_get(&key, field::META).await?.is_none() {
            let removed = self
                .store
                .list_remove(&keys::in_flight(queue), id, 0)
                .await?;
            return Ok(if removed > 0 {
                debug!(queue, id, "removed in-flight id without a record");
                Outcome::Orphaned
            } else {
                Outcome::Skipped
            });
        }

        let slot = (queue.to_owned(), id.to_owned());
        let first_seen = *self.unleased.entry(slot.clone()).or_insert(now);
        seen.insert(slot.clone());

        if now - first_seen < self.grace {
            return Ok(Outcome::Skipped);
        }

        let guard = Guard::HashFieldEquals {
            key,
            field: field::RECEIPT.to_owned(),
            value: None,
        };
        let ops = vec![Op::ListMoveValue {
            src: keys::in_flight(queue),
            dst: keys::available(queue),
            value: id.to_owned(),
        }];

        let moved = matches!(
            self.store.atomic_batch_if(guard, ops).await?.as_deref(),
            Some([1])
        );
        self.unleased.remove(&slot);

        if moved {
            warn!(queue, id, "returned unleased in-flight message to its queue");
            Ok(Outcome::Requeued)
        } else {
            Ok(Outcome::Skipped)
        }
    }
}

fn receipt_guard(key: &str, lease: &Lease) -> Guard {
    Guard::HashFieldEquals {
        key: key.to_owned(),
        field: field::RECEIPT.to_owned(),
        value: Some(Bytes::from(lease.receipt.clone())),
    }
}

fn register_queue(queue: &str, now: DateTime<Utc>) -> Op {
    Op::SortedSetAdd {
        key: keys::QUEUES.to_owned(),
        score: message::score(now),
        member: queue.to_owned(),
    }
}
