use std::time::Duration;

use chrono::{TimeDelta, Utc};
use leasemq::{keys, reaper::ReapReport, store::End};

mod common;

use common::{after_timeout, interleaving_queue, memory_queue, unique, TIMEOUT};

#[tokio::test]
async fn test_unexpired_lease_is_left_alone() {
    let queue = memory_queue();
    let name = unique("busy");

    queue.push(&name, "x").await.unwrap();
    queue.pull(&name, TIMEOUT).await.unwrap();

    let report = queue.reaper().run_once().await;

    assert_eq!(report, ReapReport::default());
    assert_eq!(queue.stats(&name).await.unwrap().in_flight, 1);
}

#[tokio::test]
async fn test_requeue_keeps_retry_count() {
    let queue = memory_queue();
    let name = unique("requeue");

    let id = queue.push(&name, "x").await.unwrap();
    queue.pull(&name, Duration::ZERO).await.unwrap();

    let report = queue.reaper().run_once_at(after_timeout()).await;
    assert_eq!(report.requeued, 1);

    let store = queue.store();
    let record = store.hash_get_all(&keys::message(&id)).await.unwrap();
    assert_eq!(&record["retry_count"][..], b"1");
    assert!(!record.contains_key("receipt"));
    assert!(store
        .sorted_set_range_by_score(keys::VISIBILITY, f64::INFINITY)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_dead_letter_queue_does_not_dead_letter_again() {
    let queue = memory_queue();
    let name = unique("poison");
    let dead_letter = queue.options().dead_letter_queue.clone();

    queue.push(&name, "x").await.unwrap();

    let mut reports = Vec::new();
    for _ in 0..queue.options().max_retries {
        queue.pull(&name, TIMEOUT).await.unwrap();
        reports.push(queue.reaper().run_once_at(after_timeout()).await);
    }
    assert_eq!(reports.iter().map(|r| r.requeued).sum::<u64>(), 2);
    assert_eq!(reports.last().unwrap().dead_lettered, 1);

    // Expiring out of the dead-letter queue lands back in it.
    queue.pull(&dead_letter, TIMEOUT).await.unwrap();
    let report = queue.reaper().run_once_at(after_timeout()).await;
    assert_eq!((report.requeued, report.dead_lettered), (1, 0));

    let stats = queue.stats(&dead_letter).await.unwrap();
    assert_eq!((stats.available, stats.in_flight), (1, 0));
    assert_eq!(queue.stats(&name).await.unwrap().available, 0);
}

#[tokio::test]
async fn test_missing_record_is_orphaned() {
    let queue = memory_queue();
    let name = unique("orphan");

    let id = queue.push(&name, "x").await.unwrap();
    queue.pull(&name, TIMEOUT).await.unwrap();
    queue.store().hash_delete(&keys::message(&id)).await.unwrap();

    let report = queue.reaper().run_once_at(after_timeout()).await;

    assert_eq!(report.orphaned, 1);
    assert_eq!(report.requeued, 0);
    let stats = queue.stats(&name).await.unwrap();
    assert_eq!((stats.available, stats.in_flight), (0, 0));
}

#[tokio::test]
async fn test_malformed_expiry_entry_is_dropped() {
    let queue = memory_queue();
    let store = queue.store();

    store
        .sorted_set_add(keys::VISIBILITY, 0.0, "no-separator")
        .await
        .unwrap();

    let report = queue.reaper().run_once().await;

    assert_eq!(report.orphaned, 1);
    assert!(store
        .sorted_set_range_by_score(keys::VISIBILITY, f64::INFINITY)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_competing_reapers_move_once() {
    let (queue, _store) = interleaving_queue();
    let name = unique("shared");

    let id = queue.push(&name, "x").await.unwrap();
    queue.pull(&name, TIMEOUT).await.unwrap();

    let at = after_timeout();
    let mut first = queue.reaper();
    let mut second = queue.reaper();

    // Every store call yields, so both reapers read the same expired entry
    // before either one moves it.
    let (a, b) = tokio::join!(first.run_once_at(at), second.run_once_at(at));

    assert_eq!(a.requeued + b.requeued, 1);
    assert_eq!(a.orphaned + b.orphaned, 0);
    assert_eq!(
        queue.store().list_range(&keys::available(&name)).await.unwrap(),
        vec![id]
    );
    assert_eq!(queue.stats(&name).await.unwrap().in_flight, 0);
    assert!(queue
        .store()
        .sorted_set_range_by_score(keys::VISIBILITY, f64::INFINITY)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_in_flight_sweep_runs_every_half_grace() {
    let queue = memory_queue();
    let name = unique("throttled");
    let grace = TimeDelta::from_std(queue.options().reaper_grace).unwrap();

    let mut reaper = queue.reaper();
    let start = Utc::now();
    reaper.run_once_at(start).await;

    // An in-flight id whose record is gone, with no expiry entry.
    let id = queue.push(&name, "x").await.unwrap();
    let store = queue.store();
    store
        .list_move(
            &keys::available(&name),
            &keys::in_flight(&name),
            End::Right,
            End::Left,
        )
        .await
        .unwrap();
    store.hash_delete(&keys::message(&id)).await.unwrap();

    let report = reaper.run_once_at(start + TimeDelta::seconds(1)).await;
    assert_eq!(report.orphaned, 0);
    assert_eq!(queue.stats(&name).await.unwrap().in_flight, 1);

    let report = reaper.run_once_at(start + grace / 2).await;
    assert_eq!(report.orphaned, 1);
    assert_eq!(queue.stats(&name).await.unwrap().in_flight, 0);
}

#[tokio::test]
async fn test_unleased_in_flight_id_recovered_after_grace() {
    let queue = memory_queue();
    let name = unique("gap");
    let grace = TimeDelta::from_std(queue.options().reaper_grace).unwrap();

    let id = queue.push(&name, "x").await.unwrap();

    // A pull that took the id but never recorded its lease.
    let store = queue.store();
    store
        .list_move(
            &keys::available(&name),
            &keys::in_flight(&name),
            End::Right,
            End::Left,
        )
        .await
        .unwrap();

    let mut reaper = queue.reaper();
    let now = Utc::now();

    let report = reaper.run_once_at(now).await;
    assert_eq!(report.recovered, 0);

    let report = reaper.run_once_at(now + grace / 2).await;
    assert_eq!(report.recovered, 0);

    let report = reaper.run_once_at(now + grace + TimeDelta::seconds(1)).await;
    assert_eq!(report.recovered, 1);

    let message = queue.pull(&name, TIMEOUT).await.unwrap();
    assert_eq!(message.id, id);
    assert_eq!(queue.stats(&name).await.unwrap().in_flight, 1);
}

#[tokio::test]
async fn test_leased_message_is_not_a_gap_suspect() {
    let queue = memory_queue();
    let name = unique("leased");

    queue.push(&name, "x").await.unwrap();
    queue.pull(&name, TIMEOUT).await.unwrap();

    let mut reaper = queue.reaper();
    let now = Utc::now();
    reaper.run_once_at(now).await;
    let report = reaper
        .run_once_at(now + TimeDelta::seconds(5))
        .await;

    assert_eq!(report, ReapReport::default());
    assert_eq!(queue.stats(&name).await.unwrap().in_flight, 1);
}

#[tokio::test]
async fn test_spawned_reaper_requeues_and_shuts_down() {
    let queue = memory_queue();
    let name = unique("background");

    let id = queue.push(&name, "x").await.unwrap();
    queue.pull(&name, Duration::ZERO).await.unwrap();

    let reaper = queue.spawn_reaper();

    let message = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match queue.pull(&name, TIMEOUT).await {
                Ok(message) => break message,
                Err(e) if e.is_queue_empty() => {
                    tokio::time::sleep(Duration::from_millis(10)).await
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(message.id, id);
    assert_eq!(message.retry_count, 2);

    reaper.shutdown().await;
}
