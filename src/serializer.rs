//! Pluggable byte codecs for events and snapshots.
//!
//! Serialization turns a domain object into the payload bytes stored in
//! a row; deserialization produces a self-describing attribute map that
//! the converter callbacks use to rebuild the domain object. The
//! defaults encode as JSON.

use std::marker::PhantomData;

use serde::Serialize;

use crate::error::{EventStoreError, Result};
use crate::types::{Aggregate, AttributeMap, Event};

/// Byte codec for events.
pub trait EventSerializer<E: Event>: Send + Sync {
    fn serialize(&self, event: &E) -> Result<Vec<u8>>;

    fn deserialize(&self, data: &[u8]) -> Result<AttributeMap>;
}

/// Byte codec for aggregate snapshots.
pub trait SnapshotSerializer<A: Aggregate>: Send + Sync {
    fn serialize(&self, aggregate: &A) -> Result<Vec<u8>>;

    fn deserialize(&self, data: &[u8]) -> Result<AttributeMap>;
}

/// JSON codec for events.
pub struct JsonEventSerializer<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> JsonEventSerializer<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for JsonEventSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event + Serialize> EventSerializer<E> for JsonEventSerializer<E> {
    fn serialize(&self, event: &E) -> Result<Vec<u8>> {
        serde_json::to_vec(event)
            .map_err(|e| EventStoreError::serialization_with("failed to encode event", e))
    }

    fn deserialize(&self, data: &[u8]) -> Result<AttributeMap> {
        serde_json::from_slice(data)
            .map_err(|e| EventStoreError::deserialization_with("failed to decode event payload", e))
    }
}

/// JSON codec for aggregate snapshots.
pub struct JsonSnapshotSerializer<A> {
    _marker: PhantomData<fn() -> A>,
}

impl<A> JsonSnapshotSerializer<A> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<A> Default for JsonSnapshotSerializer<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate + Serialize> SnapshotSerializer<A> for JsonSnapshotSerializer<A> {
    fn serialize(&self, aggregate: &A) -> Result<Vec<u8>> {
        serde_json::to_vec(aggregate)
            .map_err(|e| EventStoreError::serialization_with("failed to encode snapshot", e))
    }

    fn deserialize(&self, data: &[u8]) -> Result<AttributeMap> {
        serde_json::from_slice(data).map_err(|e| {
            EventStoreError::deserialization_with("failed to decode snapshot payload", e)
        })
    }
}
