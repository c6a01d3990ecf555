//! Shared test fixture: a small user-account aggregate and its events.
//!
//! Stands in for the domain model the store is otherwise oblivious to.
//! Events are a tagged enum so one converter handles every variant.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use chronicle::{Aggregate, AggregateId, AttributeMap, BoxError, Event};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccountId {
    pub value: String,
}

impl UserAccountId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl fmt::Display for UserAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserAccountId({})", self.value)
    }
}

impl AggregateId for UserAccountId {
    fn type_name(&self) -> &str {
        "UserAccount"
    }

    fn value(&self) -> &str {
        &self.value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type_name")]
pub enum UserAccountEvent {
    #[serde(rename = "UserAccountCreated")]
    Created {
        id: String,
        aggregate_id: UserAccountId,
        seq_nr: u64,
        name: String,
        occurred_at: u64,
    },
    #[serde(rename = "UserAccountNameChanged")]
    Renamed {
        id: String,
        aggregate_id: UserAccountId,
        seq_nr: u64,
        name: String,
        occurred_at: u64,
    },
}

impl Event for UserAccountEvent {
    type Id = UserAccountId;

    fn id(&self) -> &str {
        match self {
            Self::Created { id, .. } | Self::Renamed { id, .. } => id,
        }
    }

    fn type_name(&self) -> &str {
        match self {
            Self::Created { .. } => "UserAccountCreated",
            Self::Renamed { .. } => "UserAccountNameChanged",
        }
    }

    fn aggregate_id(&self) -> &UserAccountId {
        match self {
            Self::Created { aggregate_id, .. } | Self::Renamed { aggregate_id, .. } => aggregate_id,
        }
    }

    fn seq_nr(&self) -> u64 {
        match self {
            Self::Created { seq_nr, .. } | Self::Renamed { seq_nr, .. } => *seq_nr,
        }
    }

    fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    fn occurred_at(&self) -> u64 {
        match self {
            Self::Created { occurred_at, .. } | Self::Renamed { occurred_at, .. } => *occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserAccountId,
    pub name: String,
    pub seq_nr: u64,
    pub version: u64,
}

impl UserAccount {
    /// New aggregate at seq 1, version 1, together with its genesis event.
    pub fn new(id: UserAccountId, name: impl Into<String>) -> (Self, UserAccountEvent) {
        let name = name.into();
        let aggregate = Self {
            id: id.clone(),
            name: name.clone(),
            seq_nr: 1,
            version: 1,
        };
        let event = UserAccountEvent::Created {
            id: Ulid::new().to_string(),
            aggregate_id: id,
            seq_nr: 1,
            name,
            occurred_at: now_nanos(),
        };
        (aggregate, event)
    }

    /// Renamed copy at the next sequence number, with the event that
    /// records it.
    pub fn rename(&self, name: impl Into<String>) -> (Self, UserAccountEvent) {
        let name = name.into();
        let mut next = self.clone();
        next.name = name.clone();
        next.seq_nr += 1;
        let event = UserAccountEvent::Renamed {
            id: Ulid::new().to_string(),
            aggregate_id: self.id.clone(),
            seq_nr: next.seq_nr,
            name,
            occurred_at: now_nanos(),
        };
        (next, event)
    }

    /// Fold events newer than the snapshot back into the state.
    pub fn replay(
        events: impl IntoIterator<Item = UserAccountEvent>,
        snapshot: UserAccount,
    ) -> UserAccount {
        events.into_iter().fold(snapshot, |state, event| state.apply(event))
    }

    fn apply(mut self, event: UserAccountEvent) -> UserAccount {
        if let UserAccountEvent::Renamed { name, seq_nr, .. } = event {
            self.name = name;
            self.seq_nr = seq_nr;
        }
        self
    }
}

impl Aggregate for UserAccount {
    type Id = UserAccountId;

    fn id(&self) -> &UserAccountId {
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

pub fn event_converter(map: &AttributeMap) -> Result<UserAccountEvent, BoxError> {
    serde_json::from_value(serde_json::Value::Object(map.clone())).map_err(Into::into)
}

pub fn snapshot_converter(map: &AttributeMap) -> Result<UserAccount, BoxError> {
    serde_json::from_value(serde_json::Value::Object(map.clone())).map_err(Into::into)
}

fn now_nanos() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}
