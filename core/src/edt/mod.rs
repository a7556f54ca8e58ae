//! Event-driven gate: memoriser, filter and mode gate operators feeding
//! workflow starts, plus the gate service used by the control plane.

pub mod filter;
pub mod gate;
pub mod memory;
pub mod mode_gate;
pub mod state_memory;

pub use filter::FilterOperator;
pub use gate::{GateService, ModeChangeEvent, DEFAULT_ENABLED};
pub use memory::{EdtMemory, EntityState, FilterDecision, StateObservation};
pub use mode_gate::ModeGateOperator;
pub use state_memory::StateMemoryOperator;

/// Where operators look for the entity id unless configured otherwise
pub const DEFAULT_ENTITY_FIELD: &str = "payload.entity_id";
