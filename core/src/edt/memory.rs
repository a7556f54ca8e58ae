//! In-memory state of the event-driven gate operators
//!
//! Keyed by `(memory or filter name, entity_id)` and shared by every graph
//! of the process. Lost on restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Fields maintained by the memoriser itself, never part of a state
pub const BOOKKEEPING_FIELDS: [&str; 3] = ["last_updated", "update_count", "last_state_change"];

/// Last observed state of one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub state: Value,
    pub update_count: u64,
    pub last_updated: DateTime<Utc>,
    pub last_state_change: Option<DateTime<Utc>>,
}

/// Outcome of recording a new observation
#[derive(Debug, Clone, PartialEq)]
pub struct StateObservation {
    pub previous: Option<EntityState>,
    pub current: EntityState,
    pub state_changed: bool,
}

/// Verdict of the filter for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Pass,
    /// Within `min_interval` of the last pass
    TooSoon,
    /// Tracked fields equal the last passed snapshot
    Duplicate,
}

#[derive(Debug, Clone)]
struct FilterState {
    last_pass: Instant,
    snapshot: Option<Value>,
}

type Key = (String, String);

fn key(name: &str, entity_id: &str) -> Key {
    (name.to_string(), entity_id.to_string())
}

#[derive(Debug, Default)]
pub struct EdtMemory {
    states: DashMap<Key, EntityState>,
    filters: DashMap<Key, FilterState>,
}

impl EdtMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `state` for an entity and compare it with the previous one.
    /// A first observation counts as a change.
    pub fn observe(&self, memory: &str, entity_id: &str, state: Value) -> StateObservation {
        let now = Utc::now();
        let mut slot = self.states.entry(key(memory, entity_id)).or_insert_with(|| EntityState {
            state: Value::Null,
            update_count: 0,
            last_updated: now,
            last_state_change: None,
        });

        let previous = (slot.update_count > 0).then(|| slot.clone());
        let state_changed = previous.as_ref().map_or(true, |prev| prev.state != state);

        slot.update_count += 1;
        slot.last_updated = now;
        if state_changed {
            slot.last_state_change = Some(now);
        }
        slot.state = state;

        StateObservation {
            previous,
            current: slot.clone(),
            state_changed,
        }
    }

    pub fn state(&self, memory: &str, entity_id: &str) -> Option<EntityState> {
        self.states.get(&key(memory, entity_id)).map(|s| s.clone())
    }

    /// Drop every entity of a memory
    pub fn clear_memory(&self, memory: &str) {
        self.states.retain(|(name, _), _| name != memory);
    }

    /// Decide whether a message passes, recording the pass if it does
    pub fn evaluate_filter(
        &self,
        filter: &str,
        entity_id: &str,
        now: Instant,
        min_interval: Duration,
        snapshot: Option<Value>,
    ) -> FilterDecision {
        let mut slot = match self.filters.entry(key(filter, entity_id)) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(FilterState {
                    last_pass: now,
                    snapshot,
                });
                return FilterDecision::Pass;
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.into_ref(),
        };

        if !min_interval.is_zero() && now.saturating_duration_since(slot.last_pass) < min_interval {
            return FilterDecision::TooSoon;
        }
        if snapshot.is_some() && snapshot == slot.snapshot {
            return FilterDecision::Duplicate;
        }

        slot.last_pass = now;
        slot.snapshot = snapshot;
        FilterDecision::Pass
    }

    pub fn reset_filter(&self, filter: &str) {
        self.filters.retain(|(name, _), _| name != filter);
    }
}
