//! In-memory reference backend.
//!
//! Fixes the semantics the persistent backend must match, with the same
//! optimistic-lock behavior and none of the storage concerns: no
//! serialization, no retention, aggregates and events held as cloned
//! values keyed by the canonical aggregate-id string.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{EventStoreError, Result};
use crate::storage::EventStore;
use crate::types::{Aggregate, AggregateId, Event};

const INITIAL_VERSION: u64 = 1;

struct Inner<A, E> {
    events: HashMap<String, Vec<E>>,
    snapshots: HashMap<String, A>,
}

/// Memory-backed implementation of [`EventStore`].
pub struct MemoryEventStore<A, E> {
    inner: Mutex<Inner<A, E>>,
}

impl<A, E> MemoryEventStore<A, E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: HashMap::new(),
                snapshots: HashMap::new(),
            }),
        }
    }
}

impl<A, E> Default for MemoryEventStore<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<A, E> EventStore<A, E> for MemoryEventStore<A, E>
where
    A: Aggregate + Clone,
    E: Event<Id = A::Id> + Clone,
{
    async fn get_latest_snapshot_by_id(&self, aggregate_id: &A::Id) -> Result<Option<A>> {
        let inner = self.inner.lock().await;
        Ok(inner.snapshots.get(&aggregate_id.as_string()).cloned())
    }

    async fn get_events_by_id_since_seq_nr(
        &self,
        aggregate_id: &A::Id,
        seq_nr: u64,
    ) -> Result<Vec<E>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .get(&aggregate_id.as_string())
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.seq_nr() >= seq_nr)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn persist_event(&self, event: &E, version: u64) -> Result<()> {
        if event.is_created() {
            panic!("persist_event called with a creation event");
        }

        let aid = event.aggregate_id().as_string();
        let mut inner = self.inner.lock().await;
        let stored = inner.snapshots.get(&aid).ok_or_else(|| {
            EventStoreError::optimistic_lock(format!("no snapshot exists for aggregate {aid}"))
        })?;
        if stored.version() != version {
            return Err(EventStoreError::optimistic_lock(format!(
                "version mismatch for aggregate {aid}: expected {version}, stored {}",
                stored.version()
            )));
        }

        // The stored payload stays as-is; only the lock version moves.
        let bumped = stored.clone().with_version(version + 1);
        inner.events.entry(aid.clone()).or_default().push(event.clone());
        inner.snapshots.insert(aid, bumped);
        Ok(())
    }

    async fn persist_event_and_snapshot(&self, event: &E, aggregate: &A) -> Result<()> {
        let aid = event.aggregate_id().as_string();
        let mut inner = self.inner.lock().await;

        let new_version = if event.is_created() {
            INITIAL_VERSION
        } else {
            let stored = inner.snapshots.get(&aid).ok_or_else(|| {
                EventStoreError::optimistic_lock(format!("no snapshot exists for aggregate {aid}"))
            })?;
            if stored.version() != aggregate.version() {
                return Err(EventStoreError::optimistic_lock(format!(
                    "version mismatch for aggregate {aid}: expected {}, stored {}",
                    aggregate.version(),
                    stored.version()
                )));
            }
            stored.version() + 1
        };

        inner.events.entry(aid.clone()).or_default().push(event.clone());
        inner
            .snapshots
            .insert(aid, aggregate.clone().with_version(new_version));
        Ok(())
    }
}
