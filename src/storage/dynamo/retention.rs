//! Snapshot retention.
//!
//! Bounds the number of historical snapshot rows per aggregate after
//! each successful update: count the rows, select the ones furthest
//! past the retained window, then either mark them with a TTL so the
//! table sweeper reclaims them later or delete them in one batch.
//!
//! Count-then-delete is not atomic; concurrent writers may leave the
//! retained count off by one until the next write converges it. The
//! current-state row is never touched.

use std::time::Duration;

use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, Select, WriteRequest};
use chrono::Utc;
use tracing::debug;

use super::DynamoEventStore;
use crate::error::{EventStoreError, Result};
use crate::types::{Aggregate, AggregateId, Event};

struct SnapshotKey {
    pkey: String,
    skey: String,
}

impl<A, E> DynamoEventStore<A, E>
where
    A: Aggregate,
    E: Event<Id = A::Id>,
{
    /// Evict historical snapshots beyond the configured keep count.
    /// No-op unless snapshot retention is enabled.
    pub(super) async fn purge_excess_snapshots(&self, aggregate_id: &A::Id) -> Result<()> {
        if !self.keep_snapshot || self.keep_snapshot_count == 0 {
            return Ok(());
        }
        match self.delete_ttl {
            Some(delete_ttl) => self.mark_excess_snapshots(aggregate_id, delete_ttl).await,
            None => self.delete_excess_snapshots(aggregate_id).await,
        }
    }

    async fn mark_excess_snapshots(
        &self,
        aggregate_id: &A::Id,
        delete_ttl: Duration,
    ) -> Result<()> {
        let keys = self.excess_snapshot_keys(aggregate_id).await?;
        if keys.is_empty() {
            return Ok(());
        }

        let expires_at = Utc::now().timestamp() + delete_ttl.as_secs() as i64;
        for key in &keys {
            self.client
                .update_item()
                .table_name(&self.snapshot_table_name)
                .key("pkey", AttributeValue::S(key.pkey.clone()))
                .key("skey", AttributeValue::S(key.skey.clone()))
                .update_expression("SET #ttl = :ttl")
                .expression_attribute_names("#ttl", "ttl")
                .expression_attribute_values(":ttl", AttributeValue::N(expires_at.to_string()))
                .send()
                .await
                .map_err(|e| EventStoreError::io_with("snapshot ttl update failed", e))?;
        }

        debug!(
            aid = %aggregate_id.as_string(),
            marked = keys.len(),
            expires_at,
            "marked excess snapshots for expiry"
        );
        Ok(())
    }

    async fn delete_excess_snapshots(&self, aggregate_id: &A::Id) -> Result<()> {
        let keys = self.excess_snapshot_keys(aggregate_id).await?;
        if keys.is_empty() {
            return Ok(());
        }

        let mut requests = Vec::with_capacity(keys.len());
        for key in &keys {
            let delete = DeleteRequest::builder()
                .key("pkey", AttributeValue::S(key.pkey.clone()))
                .key("skey", AttributeValue::S(key.skey.clone()))
                .build()
                .map_err(|e| EventStoreError::io_with("failed to build snapshot delete", e))?;
            requests.push(WriteRequest::builder().delete_request(delete).build());
        }

        self.client
            .batch_write_item()
            .request_items(&self.snapshot_table_name, requests)
            .send()
            .await
            .map_err(|e| EventStoreError::io_with("snapshot batch delete failed", e))?;

        debug!(
            aid = %aggregate_id.as_string(),
            deleted = keys.len(),
            "deleted excess snapshots"
        );
        Ok(())
    }

    /// Keys of the historical rows past the retained window, newest
    /// retained rows excluded.
    async fn excess_snapshot_keys(&self, aggregate_id: &A::Id) -> Result<Vec<SnapshotKey>> {
        let count = self.snapshot_count(aggregate_id).await?;
        let historical = count.saturating_sub(1);
        let excess = historical.saturating_sub(u64::from(self.keep_snapshot_count));
        if excess == 0 {
            return Ok(Vec::new());
        }
        self.last_snapshot_keys(aggregate_id, excess as i32).await
    }

    /// Number of snapshot rows for the aggregate, current-state row
    /// included.
    async fn snapshot_count(&self, aggregate_id: &A::Id) -> Result<u64> {
        let response = self
            .client
            .query()
            .table_name(&self.snapshot_table_name)
            .index_name(&self.snapshot_aid_index_name)
            .key_condition_expression("#aid = :aid")
            .expression_attribute_names("#aid", "aid")
            .expression_attribute_values(":aid", AttributeValue::S(aggregate_id.as_string()))
            .select(Select::Count)
            .send()
            .await
            .map_err(|e| EventStoreError::io_with("snapshot count query failed", e))?;
        Ok(u64::try_from(response.count()).unwrap_or(0))
    }

    /// The `limit` oldest-eligible historical rows, selected from the
    /// high end of the index downwards. In TTL mode rows that already
    /// carry an expiry are skipped.
    async fn last_snapshot_keys(
        &self,
        aggregate_id: &A::Id,
        limit: i32,
    ) -> Result<Vec<SnapshotKey>> {
        let mut request = self
            .client
            .query()
            .table_name(&self.snapshot_table_name)
            .index_name(&self.snapshot_aid_index_name)
            .key_condition_expression("#aid = :aid AND #seq_nr > :seq_nr")
            .expression_attribute_names("#aid", "aid")
            .expression_attribute_names("#seq_nr", "seq_nr")
            .expression_attribute_values(":aid", AttributeValue::S(aggregate_id.as_string()))
            .expression_attribute_values(":seq_nr", AttributeValue::N("0".to_string()))
            .scan_index_forward(false)
            .limit(limit);
        if self.delete_ttl.is_some() {
            request = request
                .filter_expression("#ttl = :ttl")
                .expression_attribute_names("#ttl", "ttl")
                .expression_attribute_values(":ttl", AttributeValue::N("0".to_string()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| EventStoreError::io_with("snapshot key query failed", e))?;

        let mut keys = Vec::with_capacity(response.items().len());
        for item in response.items() {
            match (item.get("pkey"), item.get("skey")) {
                (Some(AttributeValue::S(pkey)), Some(AttributeValue::S(skey))) => {
                    keys.push(SnapshotKey {
                        pkey: pkey.clone(),
                        skey: skey.clone(),
                    });
                }
                _ => {
                    return Err(EventStoreError::io(
                        "snapshot row is missing its primary key",
                    ))
                }
            }
        }
        Ok(keys)
    }
}
