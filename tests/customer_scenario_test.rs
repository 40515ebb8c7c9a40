//! Customer Aggregate Scenario
//!
//! A small event-sourced aggregate on top of the store: commands are
//! decided against state folded from the stored history, and the resulting
//! events are persisted with the next version.

mod common;

use eventful::{Error, Event, EventStore, Result};
use uuid::Uuid;

const STREAM: &str = "customer";

#[derive(Debug, Default, PartialEq)]
struct Customer {
    name: Option<String>,
    contacts: Vec<String>,
    version: u64,
}

impl Customer {
    fn load(store: &EventStore, id: Uuid) -> Result<Self> {
        let mut customer = Customer::default();
        for event in store.events(STREAM, id)? {
            customer.apply(&event)?;
        }
        Ok(customer)
    }

    fn apply(&mut self, event: &Event) -> Result<()> {
        let text = String::from_utf8(event.payload().to_vec())
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;
        match event.event_type() {
            "created" => self.name = Some(text),
            "contact-added" => self.contacts.push(text),
            other => return Err(Error::InvalidEvent(format!("unknown event type {other}"))),
        }
        self.version = event.version().as_raw();
        Ok(())
    }

    fn create(&self, id: Uuid, name: &str) -> Result<Event> {
        if self.name.is_some() {
            return Err(Error::InvalidCommand("customer already exists".into()));
        }
        Event::new("created", id, self.version + 1, name.as_bytes().to_vec())
    }

    fn add_contact(&self, id: Uuid, contact: &str) -> Result<Event> {
        if self.name.is_none() {
            return Err(Error::InvalidCommand("customer doesn't exist".into()));
        }
        Event::new("contact-added", id, self.version + 1, contact.as_bytes().to_vec())
    }
}

#[tokio::test]
async fn customer_history_and_duplicate_rejection() {
    let (_dir, store) = common::create_temp_store("customer.db", &[STREAM]);
    let id = Uuid::new_v4();

    let created = Event::new("created", id, 1, b"ACME".to_vec()).unwrap();
    let contact = Event::new("contact-added", id, 2, b"jo@acme.test".to_vec()).unwrap();
    store.persist(STREAM, created.clone()).await.unwrap();
    store.persist(STREAM, contact.clone()).await.unwrap();

    assert_eq!(store.events(STREAM, id).unwrap(), vec![created, contact.clone()]);

    let rewrite = Event::new("contact-added", id, 2, b"someone@else.test".to_vec()).unwrap();
    assert!(matches!(
        store.persist(STREAM, rewrite).await,
        Err(Error::DuplicateVersion { version: 2, .. })
    ));

    let history = store.events(STREAM, id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1], contact);
}

#[tokio::test]
async fn commands_decided_against_folded_state() {
    let (_dir, store) = common::create_temp_store("commands.db", &[STREAM]);
    let id = Uuid::new_v4();

    let customer = Customer::load(&store, id).unwrap();
    assert!(matches!(
        customer.add_contact(id, "nobody"),
        Err(Error::InvalidCommand(_))
    ));

    store
        .persist(STREAM, customer.create(id, "ACME").unwrap())
        .await
        .unwrap();

    for contact in ["jo@acme.test", "sam@acme.test"] {
        let customer = Customer::load(&store, id).unwrap();
        store
            .persist(STREAM, customer.add_contact(id, contact).unwrap())
            .await
            .unwrap();
    }

    let customer = Customer::load(&store, id).unwrap();
    assert_eq!(
        customer,
        Customer {
            name: Some("ACME".into()),
            contacts: vec!["jo@acme.test".into(), "sam@acme.test".into()],
            version: 3,
        }
    );
    assert!(matches!(
        customer.create(id, "ACME again"),
        Err(Error::InvalidCommand(_))
    ));
}

#[tokio::test]
async fn stale_decision_loses_the_race() {
    let (_dir, store) = common::create_temp_store("stale.db", &[STREAM]);
    let id = Uuid::new_v4();

    let fresh = Customer::load(&store, id).unwrap();
    store
        .persist(STREAM, fresh.create(id, "ACME").unwrap())
        .await
        .unwrap();

    // Two handlers load the same state and decide independently
    let first = Customer::load(&store, id).unwrap();
    let second = Customer::load(&store, id).unwrap();

    store
        .persist(STREAM, first.add_contact(id, "jo@acme.test").unwrap())
        .await
        .unwrap();
    let lost = store
        .persist(STREAM, second.add_contact(id, "sam@acme.test").unwrap())
        .await;
    assert!(matches!(lost, Err(Error::DuplicateVersion { version: 2, .. })));

    // Reload and re-decide
    let reloaded = Customer::load(&store, id).unwrap();
    store
        .persist(STREAM, reloaded.add_contact(id, "sam@acme.test").unwrap())
        .await
        .unwrap();

    assert_eq!(Customer::load(&store, id).unwrap().contacts.len(), 2);
}
