// State machine module for execution nodes
//
// Statuses are persisted as explicit tags and every change is applied as a
// conditional update against the execution store.

pub mod errors;
pub mod events;
pub mod node_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::ExecutionEvent;
pub use node_state_machine::NodeStateMachine;
pub use states::{ExecutionStatus, EXECUTION_STATUS_TAGS};
