use serde::{Deserialize, Serialize};

use crate::Site;

/// The only event kinds that cross the push boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Delete,
}

/// One service change, self-describing and idempotent. Event streams may be
/// reordered or replayed; receivers converge on the set of currently
/// asserted memberships regardless.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub service: String,
}

impl ServiceEvent {
    pub fn add(service: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Add,
            service: service.into(),
        }
    }

    pub fn delete(service: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            service: service.into(),
        }
    }
}

/// The push payload: exactly one service change, tagged with the site it
/// concerns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTableUpdate {
    pub meta: Site,
    pub event: ServiceEvent,
}
