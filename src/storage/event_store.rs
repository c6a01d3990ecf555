//! Event store interface.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Aggregate, Event};

/// Interface for persisting events and snapshots.
///
/// Every backend provides the same optimistic-lock semantics: per
/// aggregate, writes serialize through the current-state row's
/// `version`; of two concurrent writers exactly one succeeds and the
/// other observes `EventStoreError::OptimisticLock`.
///
/// Implementations:
/// - `DynamoEventStore`: DynamoDB storage
/// - `MemoryEventStore`: in-memory reference backend
#[async_trait]
pub trait EventStore<A, E>: Send + Sync
where
    A: Aggregate,
    E: Event<Id = A::Id>,
{
    /// Latest current-state snapshot of the aggregate, re-stamped with
    /// the stored lock version, or `None` if the aggregate is unknown.
    ///
    /// After event-only writes the returned payload lags the journal;
    /// callers reconcile by replaying `get_events_by_id_since_seq_nr`
    /// from the snapshot's `seq_nr + 1`.
    async fn get_latest_snapshot_by_id(&self, aggregate_id: &A::Id) -> Result<Option<A>>;

    /// All events of the aggregate with a sequence number of at least
    /// `seq_nr`, ascending. Empty if there are none.
    async fn get_events_by_id_since_seq_nr(
        &self,
        aggregate_id: &A::Id,
        seq_nr: u64,
    ) -> Result<Vec<E>>;

    /// Appends one event and advances the aggregate's lock version from
    /// `version` to `version + 1` without rewriting the snapshot payload.
    ///
    /// # Panics
    ///
    /// Panics if `event.is_created()`; genesis events go through
    /// [`persist_event_and_snapshot`](Self::persist_event_and_snapshot).
    async fn persist_event(&self, event: &E, version: u64) -> Result<()>;

    /// Appends one event and writes the supplied aggregate as the new
    /// current-state snapshot.
    ///
    /// For a genesis event this creates the aggregate; a duplicate
    /// creation fails with `EventStoreError::OptimisticLock`. Otherwise
    /// the aggregate's own `version` is the expected lock version.
    async fn persist_event_and_snapshot(&self, event: &E, aggregate: &A) -> Result<()>;
}
