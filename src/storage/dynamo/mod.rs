//! DynamoDB backend.
//!
//! Table layout:
//! - journal: PK `(pkey: S, skey: S)`; attributes `aid: S`, `seq_nr: N`,
//!   `payload: B`, `occurred_at: N`; GSI on `(aid, seq_nr)`.
//! - snapshot: PK `(pkey: S, skey: S)`; attributes `aid: S`, `seq_nr: N`,
//!   `payload: B`, `version: N`, `ttl: N`; GSI on `(aid, seq_nr)`; `ttl`
//!   registered as the table's TTL attribute.
//!
//! The snapshot row whose `seq_nr` attribute is 0 is the aggregate's
//! current-state row and carries the optimistic-lock `version`; the
//! aggregate's true sequence number travels inside the payload. Rows at
//! an actual seq-nr are historical snapshots governed by retention.
//!
//! Every write is a single `TransactWriteItems` call, so the journal
//! append and the snapshot advance become visible atomically. A
//! conditional-check cancellation surfaces as `OptimisticLock`.

mod retention;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::error::TransactionCanceledException;
use aws_sdk_dynamodb::types::{AttributeValue, Put, TransactWriteItem, Update};
use aws_sdk_dynamodb::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EventStoreError, Result};
use crate::key_resolver::{DefaultKeyResolver, KeyResolver};
use crate::serializer::{
    EventSerializer, JsonEventSerializer, JsonSnapshotSerializer, SnapshotSerializer,
};
use crate::storage::EventStore;
use crate::types::{Aggregate, AggregateConverter, AggregateId, Event, EventConverter};

const NOT_EXISTS_CONDITION: &str = "attribute_not_exists(pkey) AND attribute_not_exists(skey)";

/// DynamoDB implementation of [`EventStore`].
pub struct DynamoEventStore<A, E>
where
    A: Aggregate,
    E: Event<Id = A::Id>,
{
    client: Client,
    journal_table_name: String,
    snapshot_table_name: String,
    journal_aid_index_name: String,
    snapshot_aid_index_name: String,
    shard_count: u64,
    event_converter: EventConverter<E>,
    snapshot_converter: AggregateConverter<A>,
    keep_snapshot: bool,
    keep_snapshot_count: u32,
    delete_ttl: Option<Duration>,
    key_resolver: Arc<dyn KeyResolver<A::Id>>,
    event_serializer: Arc<dyn EventSerializer<E>>,
    snapshot_serializer: Arc<dyn SnapshotSerializer<A>>,
}

impl<A, E> DynamoEventStore<A, E>
where
    A: Aggregate + Serialize,
    E: Event<Id = A::Id> + Serialize,
{
    /// Create a store over the given tables and secondary indexes.
    ///
    /// Defaults: snapshots are not retained, keys resolve through
    /// [`DefaultKeyResolver`], payloads encode as JSON. All options are
    /// adjusted through the `with_*` methods.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        journal_table_name: impl Into<String>,
        snapshot_table_name: impl Into<String>,
        journal_aid_index_name: impl Into<String>,
        snapshot_aid_index_name: impl Into<String>,
        shard_count: u64,
        event_converter: EventConverter<E>,
        snapshot_converter: AggregateConverter<A>,
    ) -> Result<Self> {
        let journal_table_name = journal_table_name.into();
        let snapshot_table_name = snapshot_table_name.into();
        let journal_aid_index_name = journal_aid_index_name.into();
        let snapshot_aid_index_name = snapshot_aid_index_name.into();
        if journal_table_name.is_empty() {
            return Err(EventStoreError::io("journal table name is empty"));
        }
        if snapshot_table_name.is_empty() {
            return Err(EventStoreError::io("snapshot table name is empty"));
        }
        if journal_aid_index_name.is_empty() {
            return Err(EventStoreError::io("journal aid index name is empty"));
        }
        if snapshot_aid_index_name.is_empty() {
            return Err(EventStoreError::io("snapshot aid index name is empty"));
        }
        if shard_count == 0 {
            return Err(EventStoreError::io("shard count must be at least 1"));
        }

        info!(
            journal = %journal_table_name,
            snapshot = %snapshot_table_name,
            shards = shard_count,
            "event store ready"
        );

        Ok(Self {
            client,
            journal_table_name,
            snapshot_table_name,
            journal_aid_index_name,
            snapshot_aid_index_name,
            shard_count,
            event_converter,
            snapshot_converter,
            keep_snapshot: false,
            keep_snapshot_count: 1,
            delete_ttl: None,
            key_resolver: Arc::new(DefaultKeyResolver),
            event_serializer: Arc::new(JsonEventSerializer::new()),
            snapshot_serializer: Arc::new(JsonSnapshotSerializer::new()),
        })
    }
}

impl<A, E> DynamoEventStore<A, E>
where
    A: Aggregate,
    E: Event<Id = A::Id>,
{
    /// Write and retain historical snapshot rows alongside each update.
    pub fn with_keep_snapshot(mut self, keep_snapshot: bool) -> Self {
        self.keep_snapshot = keep_snapshot;
        self
    }

    /// Historical snapshot rows retained per aggregate.
    pub fn with_keep_snapshot_count(mut self, keep_snapshot_count: u32) -> Self {
        self.keep_snapshot_count = keep_snapshot_count;
        self
    }

    /// Evict excess historical snapshots by TTL marking instead of
    /// batch deletion, leaving each row readable for `delete_ttl` after
    /// it falls out of the retained window.
    pub fn with_delete_ttl(mut self, delete_ttl: Duration) -> Self {
        self.delete_ttl = Some(delete_ttl);
        self
    }

    pub fn with_key_resolver(mut self, key_resolver: Arc<dyn KeyResolver<A::Id>>) -> Self {
        self.key_resolver = key_resolver;
        self
    }

    pub fn with_event_serializer(mut self, event_serializer: Arc<dyn EventSerializer<E>>) -> Self {
        self.event_serializer = event_serializer;
        self
    }

    pub fn with_snapshot_serializer(
        mut self,
        snapshot_serializer: Arc<dyn SnapshotSerializer<A>>,
    ) -> Self {
        self.snapshot_serializer = snapshot_serializer;
        self
    }

    /// Put for a snapshot row. `seq_nr = 0` writes the current-state
    /// row; any other value writes a historical row.
    fn put_snapshot(&self, event: &E, seq_nr: u64, aggregate: &A) -> Result<Put> {
        let id = event.aggregate_id();
        let pkey = self.key_resolver.resolve_pkey(id, self.shard_count);
        let skey = self.key_resolver.resolve_skey(id, seq_nr);
        let payload = self.snapshot_serializer.serialize(aggregate)?;

        Put::builder()
            .table_name(&self.snapshot_table_name)
            .item("pkey", AttributeValue::S(pkey))
            .item("skey", AttributeValue::S(skey))
            .item("aid", AttributeValue::S(id.as_string()))
            .item("seq_nr", AttributeValue::N(seq_nr.to_string()))
            .item("payload", AttributeValue::B(Blob::new(payload)))
            .item("version", AttributeValue::N("1".to_string()))
            .item("ttl", AttributeValue::N("0".to_string()))
            .condition_expression(NOT_EXISTS_CONDITION)
            .build()
            .map_err(|e| EventStoreError::io_with("failed to build snapshot put", e))
    }

    /// Conditional update of the current-state row: always bumps the
    /// lock version; with an aggregate it also rewrites the payload.
    fn update_snapshot(
        &self,
        event: &E,
        seq_nr: u64,
        version: u64,
        aggregate: Option<&A>,
    ) -> Result<Update> {
        let id = event.aggregate_id();
        let pkey = self.key_resolver.resolve_pkey(id, self.shard_count);
        let skey = self.key_resolver.resolve_skey(id, seq_nr);

        let mut builder = Update::builder()
            .table_name(&self.snapshot_table_name)
            .key("pkey", AttributeValue::S(pkey))
            .key("skey", AttributeValue::S(skey))
            .update_expression("SET #version = :after_version")
            .expression_attribute_names("#version", "version")
            .expression_attribute_values(":before_version", AttributeValue::N(version.to_string()))
            .expression_attribute_values(
                ":after_version",
                AttributeValue::N((version + 1).to_string()),
            )
            .condition_expression("#version = :before_version");

        if let Some(aggregate) = aggregate {
            let payload = self.snapshot_serializer.serialize(aggregate)?;
            builder = builder
                .update_expression(
                    "SET #payload = :payload, #seq_nr = :seq_nr, #version = :after_version",
                )
                .expression_attribute_names("#payload", "payload")
                .expression_attribute_names("#seq_nr", "seq_nr")
                .expression_attribute_values(":payload", AttributeValue::B(Blob::new(payload)))
                .expression_attribute_values(":seq_nr", AttributeValue::N(seq_nr.to_string()));
        }

        builder
            .build()
            .map_err(|e| EventStoreError::io_with("failed to build snapshot update", e))
    }

    /// Put for the journal row of an event.
    fn put_journal(&self, event: &E) -> Result<Put> {
        let id = event.aggregate_id();
        let pkey = self.key_resolver.resolve_pkey(id, self.shard_count);
        let skey = self.key_resolver.resolve_skey(id, event.seq_nr());
        let payload = self.event_serializer.serialize(event)?;

        Put::builder()
            .table_name(&self.journal_table_name)
            .item("pkey", AttributeValue::S(pkey))
            .item("skey", AttributeValue::S(skey))
            .item("aid", AttributeValue::S(id.as_string()))
            .item("seq_nr", AttributeValue::N(event.seq_nr().to_string()))
            .item("payload", AttributeValue::B(Blob::new(payload)))
            .item(
                "occurred_at",
                AttributeValue::N(event.occurred_at().to_string()),
            )
            .condition_expression(NOT_EXISTS_CONDITION)
            .build()
            .map_err(|e| EventStoreError::io_with("failed to build journal put", e))
    }

    /// Genesis write: current-state row plus journal row, both guarded
    /// against pre-existing keys.
    async fn create_event_and_snapshot(&self, event: &E, aggregate: &A) -> Result<()> {
        let mut items = vec![
            TransactWriteItem::builder()
                .put(self.put_snapshot(event, 0, aggregate)?)
                .build(),
            TransactWriteItem::builder()
                .put(self.put_journal(event)?)
                .build(),
        ];
        if self.keep_snapshot {
            items.push(
                TransactWriteItem::builder()
                    .put(self.put_snapshot(event, aggregate.seq_nr(), aggregate)?)
                    .build(),
            );
        }

        debug!(
            aid = %event.aggregate_id().as_string(),
            seq_nr = event.seq_nr(),
            "creating aggregate"
        );
        self.transact_write(items).await
    }

    /// Non-genesis write: journal append plus a conditional bump of the
    /// current-state row, optionally rewriting its payload and adding a
    /// historical snapshot row.
    async fn update_event_and_snapshot_opt(
        &self,
        event: &E,
        version: u64,
        aggregate: Option<&A>,
    ) -> Result<()> {
        let mut items = vec![
            TransactWriteItem::builder()
                .update(self.update_snapshot(event, 0, version, aggregate)?)
                .build(),
            TransactWriteItem::builder()
                .put(self.put_journal(event)?)
                .build(),
        ];
        if self.keep_snapshot {
            if let Some(aggregate) = aggregate {
                items.push(
                    TransactWriteItem::builder()
                        .put(self.put_snapshot(event, aggregate.seq_nr(), aggregate)?)
                        .build(),
                );
            }
        }

        debug!(
            aid = %event.aggregate_id().as_string(),
            seq_nr = event.seq_nr(),
            expected_version = version,
            "appending event"
        );
        self.transact_write(items).await
    }

    async fn transact_write(&self, items: Vec<TransactWriteItem>) -> Result<()> {
        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map(|_| ())
            .map_err(classify_transact_error)
    }
}

fn classify_transact_error(err: SdkError<TransactWriteItemsError>) -> EventStoreError {
    match err.into_service_error() {
        TransactWriteItemsError::TransactionCanceledException(cancel) => {
            if has_conditional_check_failure(&cancel) {
                EventStoreError::optimistic_lock_with(
                    "transaction canceled by a conditional check failure",
                    cancel,
                )
            } else {
                EventStoreError::io_with(
                    "transaction canceled without a conditional check failure",
                    cancel,
                )
            }
        }
        other => EventStoreError::io_with("transact write failed", other),
    }
}

fn has_conditional_check_failure(cancel: &TransactionCanceledException) -> bool {
    cancel
        .cancellation_reasons()
        .iter()
        .any(|reason| reason.code() == Some("ConditionalCheckFailed"))
}

fn number_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<u64> {
    match item.get(name) {
        Some(AttributeValue::N(value)) => value.parse::<u64>().map_err(|e| {
            EventStoreError::deserialization_with(format!("invalid numeric attribute {name}"), e)
        }),
        _ => Err(EventStoreError::deserialization(format!(
            "missing numeric attribute {name}"
        ))),
    }
}

fn binary_attr<'a>(item: &'a HashMap<String, AttributeValue>, name: &str) -> Result<&'a [u8]> {
    match item.get(name) {
        Some(AttributeValue::B(blob)) => Ok(blob.as_ref()),
        _ => Err(EventStoreError::deserialization(format!(
            "missing binary attribute {name}"
        ))),
    }
}

#[async_trait]
impl<A, E> EventStore<A, E> for DynamoEventStore<A, E>
where
    A: Aggregate,
    E: Event<Id = A::Id>,
{
    async fn get_latest_snapshot_by_id(&self, aggregate_id: &A::Id) -> Result<Option<A>> {
        let response = self
            .client
            .query()
            .table_name(&self.snapshot_table_name)
            .index_name(&self.snapshot_aid_index_name)
            .key_condition_expression("#aid = :aid AND #seq_nr = :seq_nr")
            .expression_attribute_names("#aid", "aid")
            .expression_attribute_names("#seq_nr", "seq_nr")
            .expression_attribute_values(":aid", AttributeValue::S(aggregate_id.as_string()))
            .expression_attribute_values(":seq_nr", AttributeValue::N("0".to_string()))
            .limit(1)
            .send()
            .await
            .map_err(|e| EventStoreError::io_with("latest snapshot query failed", e))?;

        match response.items() {
            [] => Ok(None),
            [item] => {
                let version = number_attr(item, "version")?;
                let map = self
                    .snapshot_serializer
                    .deserialize(binary_attr(item, "payload")?)?;
                let aggregate = (self.snapshot_converter)(&map).map_err(|e| {
                    EventStoreError::deserialization_with("snapshot converter failed", e)
                })?;
                debug!(aid = %aggregate_id.as_string(), version, "loaded snapshot");
                Ok(Some(aggregate.with_version(version)))
            }
            _ => panic!(
                "multiple current-state rows for aggregate {}",
                aggregate_id.as_string()
            ),
        }
    }

    async fn get_events_by_id_since_seq_nr(
        &self,
        aggregate_id: &A::Id,
        seq_nr: u64,
    ) -> Result<Vec<E>> {
        let response = self
            .client
            .query()
            .table_name(&self.journal_table_name)
            .index_name(&self.journal_aid_index_name)
            .key_condition_expression("#aid = :aid AND #seq_nr >= :seq_nr")
            .expression_attribute_names("#aid", "aid")
            .expression_attribute_names("#seq_nr", "seq_nr")
            .expression_attribute_values(":aid", AttributeValue::S(aggregate_id.as_string()))
            .expression_attribute_values(":seq_nr", AttributeValue::N(seq_nr.to_string()))
            .send()
            .await
            .map_err(|e| EventStoreError::io_with("journal query failed", e))?;

        let items = response.items();
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            let map = self
                .event_serializer
                .deserialize(binary_attr(item, "payload")?)?;
            let event = (self.event_converter)(&map)
                .map_err(|e| EventStoreError::deserialization_with("event converter failed", e))?;
            events.push(event);
        }
        Ok(events)
    }

    async fn persist_event(&self, event: &E, version: u64) -> Result<()> {
        if event.is_created() {
            panic!("persist_event called with a creation event");
        }
        self.update_event_and_snapshot_opt(event, version, None)
            .await?;
        self.purge_excess_snapshots(event.aggregate_id()).await
    }

    async fn persist_event_and_snapshot(&self, event: &E, aggregate: &A) -> Result<()> {
        if event.is_created() {
            self.create_event_and_snapshot(event, aggregate).await
        } else {
            self.update_event_and_snapshot_opt(event, aggregate.version(), Some(aggregate))
                .await?;
            self.purge_excess_snapshots(event.aggregate_id()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_dynamodb::config::BehaviorVersion;
    use aws_sdk_dynamodb::types::CancellationReason;
    use serde::Deserialize;
    use std::fmt;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CounterId(String);

    impl fmt::Display for CounterId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "CounterId({})", self.0)
        }
    }

    impl AggregateId for CounterId {
        fn type_name(&self) -> &str {
            "Counter"
        }

        fn value(&self) -> &str {
            &self.0
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        id: CounterId,
        count: u64,
        seq_nr: u64,
        version: u64,
    }

    impl Aggregate for Counter {
        type Id = CounterId;

        fn id(&self) -> &CounterId {
            &self.id
        }

        fn seq_nr(&self) -> u64 {
            self.seq_nr
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn with_version(mut self, version: u64) -> Self {
            self.version = version;
            self
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Incremented {
        id: String,
        aggregate_id: CounterId,
        seq_nr: u64,
        created: bool,
        occurred_at: u64,
    }

    impl Event for Incremented {
        type Id = CounterId;

        fn id(&self) -> &str {
            &self.id
        }

        fn type_name(&self) -> &str {
            "Incremented"
        }

        fn aggregate_id(&self) -> &CounterId {
            &self.aggregate_id
        }

        fn seq_nr(&self) -> u64 {
            self.seq_nr
        }

        fn is_created(&self) -> bool {
            self.created
        }

        fn occurred_at(&self) -> u64 {
            self.occurred_at
        }
    }

    fn test_client() -> Client {
        let config = aws_sdk_dynamodb::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        Client::from_conf(config)
    }

    fn store() -> DynamoEventStore<Counter, Incremented> {
        DynamoEventStore::new(
            test_client(),
            "journal",
            "snapshot",
            "journal-aid-index",
            "snapshot-aid-index",
            1,
            Arc::new(|map| {
                serde_json::from_value(serde_json::Value::Object(map.clone())).map_err(Into::into)
            }),
            Arc::new(|map| {
                serde_json::from_value(serde_json::Value::Object(map.clone())).map_err(Into::into)
            }),
        )
        .unwrap()
    }

    fn sample() -> (Counter, Incremented) {
        let id = CounterId("7".to_string());
        let aggregate = Counter {
            id: id.clone(),
            count: 1,
            seq_nr: 2,
            version: 1,
        };
        let event = Incremented {
            id: "evt-2".to_string(),
            aggregate_id: id,
            seq_nr: 2,
            created: false,
            occurred_at: 1_700_000_000_000_000_000,
        };
        (aggregate, event)
    }

    #[test]
    fn rejects_empty_table_names() {
        let result = DynamoEventStore::<Counter, Incremented>::new(
            test_client(),
            "",
            "snapshot",
            "journal-aid-index",
            "snapshot-aid-index",
            1,
            Arc::new(|_| unreachable!()),
            Arc::new(|_| unreachable!()),
        );
        assert!(matches!(result, Err(EventStoreError::Io { .. })));
    }

    #[test]
    fn rejects_zero_shard_count() {
        let result = DynamoEventStore::<Counter, Incremented>::new(
            test_client(),
            "journal",
            "snapshot",
            "journal-aid-index",
            "snapshot-aid-index",
            0,
            Arc::new(|_| unreachable!()),
            Arc::new(|_| unreachable!()),
        );
        assert!(matches!(result, Err(EventStoreError::Io { .. })));
    }

    #[test]
    fn journal_put_carries_key_attributes_and_guard() {
        let store = store();
        let (_, event) = sample();

        let put = store.put_journal(&event).unwrap();

        let item = put.item();
        assert_eq!(
            item.get("pkey"),
            Some(&AttributeValue::S("Counter-0".into()))
        );
        assert_eq!(
            item.get("skey"),
            Some(&AttributeValue::S("Counter-7-2".into()))
        );
        assert_eq!(
            item.get("aid"),
            Some(&AttributeValue::S("Counter-7".into()))
        );
        assert_eq!(item.get("seq_nr"), Some(&AttributeValue::N("2".into())));
        assert_eq!(put.condition_expression(), Some(NOT_EXISTS_CONDITION));
    }

    #[test]
    fn current_state_put_uses_seq_nr_zero_and_initial_version() {
        let store = store();
        let (aggregate, event) = sample();

        let put = store.put_snapshot(&event, 0, &aggregate).unwrap();

        let item = put.item();
        assert_eq!(
            item.get("skey"),
            Some(&AttributeValue::S("Counter-7-0".into()))
        );
        assert_eq!(item.get("seq_nr"), Some(&AttributeValue::N("0".into())));
        assert_eq!(item.get("version"), Some(&AttributeValue::N("1".into())));
        assert_eq!(item.get("ttl"), Some(&AttributeValue::N("0".into())));
    }

    #[test]
    fn event_only_update_bumps_version_without_payload() {
        let store = store();
        let (_, event) = sample();

        let update = store.update_snapshot(&event, 0, 4, None).unwrap();

        assert_eq!(update.update_expression(), "SET #version = :after_version");
        assert_eq!(
            update.condition_expression(),
            Some("#version = :before_version")
        );
        let values = update.expression_attribute_values().unwrap();
        assert_eq!(
            values.get(":before_version"),
            Some(&AttributeValue::N("4".into()))
        );
        assert_eq!(
            values.get(":after_version"),
            Some(&AttributeValue::N("5".into()))
        );
        assert!(!values.contains_key(":payload"));
    }

    #[test]
    fn snapshot_update_rewrites_payload_and_seq_nr() {
        let store = store();
        let (aggregate, event) = sample();

        let update = store
            .update_snapshot(&event, 0, 1, Some(&aggregate))
            .unwrap();

        assert_eq!(
            update.update_expression(),
            "SET #payload = :payload, #seq_nr = :seq_nr, #version = :after_version"
        );
        let values = update.expression_attribute_values().unwrap();
        assert!(values.contains_key(":payload"));
        assert_eq!(values.get(":seq_nr"), Some(&AttributeValue::N("0".into())));
    }

    #[test]
    fn conditional_check_failure_is_detected_in_cancellation_reasons() {
        let cancel = TransactionCanceledException::builder()
            .cancellation_reasons(CancellationReason::builder().code("None").build())
            .cancellation_reasons(
                CancellationReason::builder()
                    .code("ConditionalCheckFailed")
                    .build(),
            )
            .build();
        assert!(has_conditional_check_failure(&cancel));

        let benign = TransactionCanceledException::builder()
            .cancellation_reasons(CancellationReason::builder().code("None").build())
            .build();
        assert!(!has_conditional_check_failure(&benign));
    }

    #[test]
    fn missing_attributes_are_deserialization_errors() {
        let item = HashMap::new();
        assert!(matches!(
            number_attr(&item, "version"),
            Err(EventStoreError::Deserialization { .. })
        ));
        assert!(matches!(
            binary_attr(&item, "payload"),
            Err(EventStoreError::Deserialization { .. })
        ));
    }
}
