//! Lifecycle state machine for task-package instances
//!
//! The transition table is closed: every `(status, event)` pair either yields
//! exactly one target status or is rejected. Terminal statuses accept nothing.

use crate::errors::{WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// LIFECYCLE STATUS
// ============================================================================

/// Persisted lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    /// Accepted by the control plane, not yet picked up by an entry operator
    Created,

    /// Entry operator registered the instance in its graph
    Started,

    /// An intermediate operator reported progress
    Ongoing,

    /// Cancellation requested, waiting for the exit operator
    Cancelling,

    /// Exit operator observed the cancellation
    Cancelled,

    /// Exit operator reached normally
    Completed,

    /// Unrecoverable error
    Failed,
}

impl LifecycleStatus {
    pub const ALL: [LifecycleStatus; 7] = [
        LifecycleStatus::Created,
        LifecycleStatus::Started,
        LifecycleStatus::Ongoing,
        LifecycleStatus::Cancelling,
        LifecycleStatus::Cancelled,
        LifecycleStatus::Completed,
        LifecycleStatus::Failed,
    ];

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleStatus::Completed | LifecycleStatus::Cancelled | LifecycleStatus::Failed
        )
    }

    /// Statuses from which a workflow is still running normally
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LifecycleStatus::Created | LifecycleStatus::Started | LifecycleStatus::Ongoing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Created => "created",
            LifecycleStatus::Started => "started",
            LifecycleStatus::Ongoing => "ongoing",
            LifecycleStatus::Cancelling => "cancelling",
            LifecycleStatus::Cancelled => "cancelled",
            LifecycleStatus::Completed => "completed",
            LifecycleStatus::Failed => "failed",
        }
    }

    /// Apply an event, returning the target status
    pub fn apply(self, event: TransitionEvent) -> WorkflowResult<LifecycleStatus> {
        use LifecycleStatus::*;

        let target = match (self, event) {
            (Created, TransitionEvent::EntryReceived) => Some(Started),
            (Started, TransitionEvent::Progress) => Some(Ongoing),
            // Progress reports while already ongoing are no-ops
            (Ongoing, TransitionEvent::Progress) => Some(Ongoing),

            (Created | Started | Ongoing, TransitionEvent::CancelRequested) => Some(Cancelling),

            (Created | Started | Ongoing, TransitionEvent::ExitReached) => Some(Completed),
            (Cancelling, TransitionEvent::ExitReached) => Some(Cancelled),

            (s, TransitionEvent::Failure) if !s.is_terminal() => Some(Failed),

            _ => None,
        };

        target.ok_or(WorkflowError::InvalidTransition {
            from: self,
            to: event.nominal_target(),
        })
    }

    /// Check if any event leads from this state to `target`
    pub fn can_transition_to(&self, target: LifecycleStatus) -> bool {
        TransitionEvent::ALL
            .iter()
            .any(|event| matches!(self.apply(*event), Ok(t) if t == target))
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| WorkflowError::Validation(format!("Unknown lifecycle status: {}", s)))
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events that drive lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    /// Entry operator received the create event
    EntryReceived,

    /// Intermediate operator opted in to report progress
    Progress,

    /// Control plane accepted a cancel request
    CancelRequested,

    /// Message reached the exit operator
    ExitReached,

    /// Unrecoverable error
    Failure,
}

impl TransitionEvent {
    pub const ALL: [TransitionEvent; 5] = [
        TransitionEvent::EntryReceived,
        TransitionEvent::Progress,
        TransitionEvent::CancelRequested,
        TransitionEvent::ExitReached,
        TransitionEvent::Failure,
    ];

    /// Target used for error reporting when the transition is rejected
    fn nominal_target(&self) -> LifecycleStatus {
        match self {
            TransitionEvent::EntryReceived => LifecycleStatus::Started,
            TransitionEvent::Progress => LifecycleStatus::Ongoing,
            TransitionEvent::CancelRequested => LifecycleStatus::Cancelling,
            TransitionEvent::ExitReached => LifecycleStatus::Completed,
            TransitionEvent::Failure => LifecycleStatus::Failed,
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionEvent::EntryReceived => write!(f, "EntryReceived"),
            TransitionEvent::Progress => write!(f, "Progress"),
            TransitionEvent::CancelRequested => write!(f, "CancelRequested"),
            TransitionEvent::ExitReached => write!(f, "ExitReached"),
            TransitionEvent::Failure => write!(f, "Failure"),
        }
    }
}
