//! Capability traits for the domain objects the store persists.
//!
//! The store is polymorphic over aggregates and events through these
//! traits plus two converter callbacks. It never looks at domain state
//! beyond the identifiers and counters declared here; reconstruction
//! after deserialization is delegated to the callbacks.

use std::fmt;
use std::sync::Arc;

/// Self-describing attribute map produced by payload deserialization
/// and handed to the converter callbacks.
pub type AttributeMap = serde_json::Map<String, serde_json::Value>;

/// Boxed error returned by converter callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Identity of an aggregate.
pub trait AggregateId: fmt::Display + Send + Sync + 'static {
    /// Type name of the aggregate, e.g. `"UserAccount"`.
    fn type_name(&self) -> &str;

    /// Identifier value within the type.
    fn value(&self) -> &str;

    /// Canonical string form, `{type_name}-{value}`.
    fn as_string(&self) -> String {
        format!("{}-{}", self.type_name(), self.value())
    }
}

/// A consistency unit with a monotonic event sequence and an
/// optimistic-lock version.
pub trait Aggregate: fmt::Debug + Send + Sync + 'static {
    type Id: AggregateId;

    fn id(&self) -> &Self::Id;

    /// Sequence number of the last event folded into this state.
    fn seq_nr(&self) -> u64;

    /// Optimistic-lock counter of the current-state row.
    fn version(&self) -> u64;

    /// The same state under a different lock version.
    fn with_version(self, version: u64) -> Self
    where
        Self: Sized;
}

/// An immutable fact belonging to an aggregate.
pub trait Event: fmt::Debug + Send + Sync + 'static {
    type Id: AggregateId;

    fn id(&self) -> &str;

    fn type_name(&self) -> &str;

    fn aggregate_id(&self) -> &Self::Id;

    fn seq_nr(&self) -> u64;

    /// True only for the genesis event of an aggregate.
    fn is_created(&self) -> bool;

    /// Epoch nanoseconds.
    fn occurred_at(&self) -> u64;
}

/// Rebuilds an aggregate from a deserialized snapshot payload.
pub type AggregateConverter<A> =
    Arc<dyn Fn(&AttributeMap) -> std::result::Result<A, BoxError> + Send + Sync>;

/// Rebuilds an event from a deserialized journal payload.
pub type EventConverter<E> =
    Arc<dyn Fn(&AttributeMap) -> std::result::Result<E, BoxError> + Send + Sync>;
