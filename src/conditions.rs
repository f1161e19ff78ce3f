//! Lifecycle event bookkeeping and well-known metadata keys
//!
//! The state machine records one event per component step ("databaseCreated",
//! "brokerDeleting", ...). The set is persisted in `status.conditions` so a
//! restarted operator knows which steps already completed.

use chrono::Utc;

use crate::crd::ClusterCondition;

// Finalizer names
pub const CLUSTER_FINALIZER: &str = "stratus.io/cluster-teardown";

// Annotations
pub const RESTART_ANNOTATION: &str = "stratus.io/restart";

// Labels carried by every child resource
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_SPEC_HASH: &str = "stratus.io/spec-hash";
pub const MANAGER_NAME: &str = "stratus-operator";

// Event suffixes
pub const EVENT_DEPLOYING: &str = "Deploying";
pub const EVENT_CREATED: &str = "Created";
pub const EVENT_DELETING: &str = "Deleting";
pub const EVENT_DELETED: &str = "Deleted";

pub fn deploying(component: &str) -> String {
    format!("{}{}", component, EVENT_DEPLOYING)
}

pub fn created(component: &str) -> String {
    format!("{}{}", component, EVENT_CREATED)
}

pub fn deleting(component: &str) -> String {
    format!("{}{}", component, EVENT_DELETING)
}

pub fn deleted(component: &str) -> String {
    format!("{}{}", component, EVENT_DELETED)
}

/// Build a condition stamped with the current time.
pub fn build_condition(event: &str) -> ClusterCondition {
    let now = Utc::now().to_rfc3339();
    ClusterCondition {
        event: event.to_string(),
        last_transition_time: Some(now.clone()),
        last_heartbeat_time: Some(now),
    }
}

/// Ordered set of lifecycle events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterEvents {
    conditions: Vec<ClusterCondition>,
}

impl ClusterEvents {
    pub fn from_conditions(conditions: &[ClusterCondition]) -> Self {
        let mut events = Self::default();
        for condition in conditions {
            if !events.contains(&condition.event) {
                events.conditions.push(condition.clone());
            }
        }
        events
    }

    pub fn contains(&self, event: &str) -> bool {
        self.conditions.iter().any(|c| c.event == event)
    }

    /// Add an event, or refresh its heartbeat if it is already present.
    /// The transition time is kept from the first recording.
    pub fn record(&mut self, event: &str) {
        let fresh = build_condition(event);
        match self.conditions.iter_mut().find(|c| c.event == event) {
            Some(existing) => existing.last_heartbeat_time = fresh.last_heartbeat_time,
            None => self.conditions.push(fresh),
        }
    }

    /// Remove an event. Returns true if it was present.
    pub fn remove(&mut self, event: &str) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.event != event);
        before != self.conditions.len()
    }

    /// Remove every event whose name ends with `suffix`.
    pub fn remove_suffix(&mut self, suffix: &str) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| !c.event.ends_with(suffix));
        before != self.conditions.len()
    }

    pub fn to_conditions(&self) -> Vec<ClusterCondition> {
        self.conditions.clone()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|c| c.event.as_str())
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}
