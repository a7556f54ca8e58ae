// Taskpack: task-package workflow orchestration
// Core library providing the state machine, store, event bus and graph runtime

pub mod context;
pub mod edt;
pub mod errors;
pub mod events;
pub mod graph;
pub mod kv;
pub mod message;
pub mod operators;
pub mod registry;
pub mod runtime;
pub mod state_machine;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use errors::{ErrorKind, WorkflowError, WorkflowResult};

pub use state_machine::{LifecycleStatus, TransitionEvent};

pub use types::{
    Definition, FieldType, GateAction, GateHistoryEntry, GateRow, Instance, InstanceFilter,
    PayloadSchema,
};

pub use store::SqliteTaskStore;

pub use events::{topics, BusEvent, EventBus, EventBusStats, EventSubscription, TopicFilter};

pub use context::{ActiveTask, ContextRegistry, GraphContext};

pub use message::{FlowMessage, WorkflowContext};

pub use kv::{KvEntry, ScopedKvStore};

pub use registry::{CancelOutcome, InstanceRegistry, RegistryConfig, StartEvent, TerminalRequest};

pub use graph::{Graph, GraphSpec, NodeContext, NodeSpec, Operator, OperatorRegistry, Output};

pub use edt::{EdtMemory, GateService, ModeChangeEvent};

pub use runtime::{Runtime, RuntimeConfig, RuntimeServices};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
