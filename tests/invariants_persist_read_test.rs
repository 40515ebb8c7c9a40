//! Persist / Read Invariant Tests
//!
//! - Versions come back in ascending order, exactly as persisted
//! - A taken `(aggregate_id, version)` is rejected and stays unchanged
//! - Appending behind the latest version is rejected
//! - Unknown aggregates read as empty
//! - Aggregates and streams don't see each other's events

mod common;

use eventful::{Error, Event, Version};
use uuid::Uuid;

#[tokio::test]
async fn persisted_sequence_reads_back_in_order() {
    let (_dir, store) = common::create_temp_store("ordered.db", &["customer"]);
    let aggregate = Uuid::new_v4();

    let persisted: Vec<Event> = (1..=25).map(|v| common::event(aggregate, v)).collect();
    for event in &persisted {
        store.persist("customer", event.clone()).await.unwrap();
    }

    let read = store.events("customer", aggregate).unwrap();
    assert_eq!(read, persisted);
    assert_eq!(common::versions(&read), (1..=25).collect::<Vec<_>>());
}

#[tokio::test]
async fn pipelined_persists_keep_order() {
    let (_dir, store) = common::create_temp_store("pipelined.db", &["customer"]);
    let aggregate = Uuid::new_v4();

    // Queue everything before awaiting anything
    let pending: Vec<_> = (1..=200)
        .map(|v| store.persist("customer", common::event(aggregate, v)))
        .collect();
    for result in futures::future::join_all(pending).await {
        result.unwrap();
    }

    let read = store.events("customer", aggregate).unwrap();
    assert_eq!(common::versions(&read), (1..=200).collect::<Vec<_>>());
}

#[tokio::test]
async fn duplicate_version_is_rejected() {
    let (_dir, store) = common::create_temp_store("duplicate.db", &["customer"]);
    let aggregate = Uuid::new_v4();

    let first = Event::new("created", aggregate, 1, b"first".to_vec()).unwrap();
    let second = Event::new("created", aggregate, 1, b"second".to_vec()).unwrap();

    store.persist("customer", first.clone()).await.unwrap();
    let err = store.persist("customer", second).await.unwrap_err();

    match err {
        Error::DuplicateVersion {
            stream_type,
            aggregate_id,
            version,
        } => {
            assert_eq!(stream_type, "customer");
            assert_eq!(aggregate_id, aggregate);
            assert_eq!(version, 1);
        }
        other => panic!("expected DuplicateVersion, got {other:?}"),
    }

    assert_eq!(store.events("customer", aggregate).unwrap(), vec![first]);
}

#[tokio::test]
async fn lower_version_is_inconsistent() {
    let (_dir, store) = common::create_temp_store("inconsistent.db", &["customer"]);
    let aggregate = Uuid::new_v4();

    for v in 1..=3 {
        store
            .persist("customer", common::event(aggregate, v))
            .await
            .unwrap();
    }

    let stale = Event::new("changed", aggregate, 2, b"stale".to_vec()).unwrap();
    let err = store.persist("customer", stale).await.unwrap_err();
    assert!(matches!(err, Error::InconsistentVersion { version: 2, .. }));

    let read = store.events("customer", aggregate).unwrap();
    assert_eq!(common::versions(&read), vec![1, 2, 3]);
    assert!(read.iter().all(|e| e.payload() != b"stale"));
}

#[tokio::test]
async fn version_gaps_are_accepted() {
    let (_dir, store) = common::create_temp_store("gaps.db", &["customer"]);
    let aggregate = Uuid::new_v4();

    store.persist("customer", common::event(aggregate, 1)).await.unwrap();
    store.persist("customer", common::event(aggregate, 5)).await.unwrap();

    assert_eq!(
        common::versions(&store.events("customer", aggregate).unwrap()),
        vec![1, 5]
    );
    assert_eq!(
        store.current_version("customer", aggregate).unwrap(),
        Some(Version::new(5).unwrap())
    );
}

#[test]
fn unknown_aggregate_reads_empty() {
    let (_dir, store) = common::create_temp_store("empty.db", &["customer"]);
    let unused = Uuid::new_v4();

    assert!(store.events("customer", unused).unwrap().is_empty());
    assert_eq!(store.current_version("customer", unused).unwrap(), None);
}

#[test]
fn unknown_stream_is_rejected() {
    let (_dir, store) = common::create_temp_store("unknown.db", &["customer"]);

    assert!(matches!(
        store.events("order", Uuid::new_v4()),
        Err(Error::UnknownStream { .. })
    ));
    assert!(matches!(
        store.persist("order", common::event(Uuid::new_v4(), 1)).wait(),
        Err(Error::UnknownStream { .. })
    ));
}

#[tokio::test]
async fn aggregates_and_streams_are_isolated() {
    let (_dir, store) = common::create_temp_store("isolated.db", &["customer", "order"]);
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    store.persist("customer", common::event(a, 1)).await.unwrap();
    store.persist("customer", common::event(b, 1)).await.unwrap();
    // Same aggregate id and version in another stream is a different slot
    store.persist("order", common::event(a, 1)).await.unwrap();

    assert_eq!(store.events("customer", a).unwrap().len(), 1);
    assert_eq!(store.events("customer", b).unwrap().len(), 1);
    assert_eq!(store.events("order", a).unwrap().len(), 1);
    assert!(store.events("order", b).unwrap().is_empty());
}

#[tokio::test]
async fn event_fields_round_trip() {
    let (_dir, store) = common::create_temp_store("fields.db", &["customer"]);
    let aggregate = Uuid::new_v4();
    let payload = vec![0u8, 159, 146, 150, 255];

    let event = Event::new("contact-added", aggregate, 1, payload.clone()).unwrap();
    store.persist("customer", event.clone()).await.unwrap();

    let read = store.events("customer", aggregate).unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].id(), event.id());
    assert_eq!(read[0].event_type(), "contact-added");
    assert_eq!(read[0].aggregate_id(), aggregate);
    assert_eq!(read[0].version(), Version::FIRST);
    assert_eq!(read[0].payload(), payload.as_slice());
}
