//! Concurrency Tests
//!
//! Many producers, one writer. Checks that every persist is resolved, that
//! racing writers on one version produce exactly one winner, and that a
//! tiny queue applies backpressure instead of dropping work.

mod common;

use std::sync::Arc;
use std::thread;

use eventful::{Error, Event};
use uuid::Uuid;

#[test]
fn many_threads_many_aggregates() {
    let (_dir, store) = common::create_temp_store("threads.db", &["customer"]);
    let store = Arc::new(store);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let aggregate = Uuid::new_v4();
                let pending: Vec<_> = (1..=100)
                    .map(|v| store.persist("customer", common::event(aggregate, v)))
                    .collect();
                for p in pending {
                    p.wait().unwrap();
                }
                aggregate
            })
        })
        .collect();

    for handle in handles {
        let aggregate = handle.join().unwrap();
        let events = store.events("customer", aggregate).unwrap();
        assert_eq!(common::versions(&events), (1..=100).collect::<Vec<_>>());
    }

    assert_eq!(store.stats().events_committed, 800);
}

#[test]
fn racing_writers_have_one_winner() {
    let (_dir, store) = common::create_temp_store("race.db", &["customer"]);
    let store = Arc::new(store);
    let aggregate = Uuid::new_v4();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let event =
                    Event::new("created", aggregate, 1, format!("writer-{i}").into_bytes())
                        .unwrap();
                loop {
                    match store.persist("customer", event.clone()).wait() {
                        Err(Error::RetryBatch) => continue,
                        other => return other,
                    }
                }
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    let duplicates = outcomes
        .iter()
        .filter(|r| matches!(r, Err(Error::DuplicateVersion { .. })))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(store.events("customer", aggregate).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_tasks_share_the_store() {
    let (_dir, store) = common::create_temp_store("tasks.db", &["customer"]);
    let store = Arc::new(store);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let aggregate = Uuid::new_v4();
                for v in 1..=20 {
                    store
                        .persist("customer", common::event(aggregate, v))
                        .await
                        .unwrap();
                }
                aggregate
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        let aggregate = task.unwrap();
        assert_eq!(store.events("customer", aggregate).unwrap().len(), 20);
    }
}

#[test]
fn small_queue_applies_backpressure() {
    let (_dir, store) = common::create_temp_store_with_config(
        "backpressure.db",
        &["customer"],
        common::config_with_queue_capacity(4),
    );
    let aggregate = Uuid::new_v4();

    // Far more than the queue holds; persist blocks instead of failing
    let pending: Vec<_> = (1..=500)
        .map(|v| store.persist("customer", common::event(aggregate, v)))
        .collect();
    for p in pending {
        p.wait().unwrap();
    }

    assert_eq!(store.events("customer", aggregate).unwrap().len(), 500);
    // No batch can be larger than the queue
    assert!(store.stats().batches_committed >= 500 / 4);
}
