//! Foreman core library — domain types, durable state, breakers, config.
//!
//! Public API surface:
//! - [`types`] — newtypes and domain structs, including [`UnifiedState`]
//! - [`error`] — [`StateError`]
//! - [`state`] — lock-protected, atomically persisted state store
//! - [`breaker`] — circuit breaker state machine with injectable clock
//! - [`config`] — engine configuration load / save

pub mod breaker;
pub mod config;
pub mod error;
pub mod state;
pub mod types;

pub use breaker::{Breaker, BreakerPolicy, Clock, SystemClock};
pub use config::{EngineConfig, MergePolicy};
pub use error::StateError;
pub use state::{FileStateStore, MemoryStateStore, StateStore};
pub use types::{
    AgentWorkspace, BreakerName, BreakerRecord, BreakerState, LoopState, Metrics, Task, TaskId,
    TaskStatus, UnifiedState, WorkspaceStatus, STATE_VERSION,
};
