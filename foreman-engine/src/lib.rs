//! Foreman engine library — the async dispatch/execute/verify/merge pipeline.
//!
//! Public API surface:
//! - [`orchestrator`] — [`Orchestrator`], batch reports, halt reasons
//! - [`task_source`] — [`TaskSource`] and its JSON/in-memory implementations
//! - [`invoker`] — [`GenerationInvoker`] and the command-based implementation
//! - [`verifier`] — [`VerificationRunner`] and the command-based implementation
//! - [`policy`] — dispatch admission (breaker + retry budget)
//! - [`scheduler`] — dependency-gated batch selection
//! - [`error`] — [`EngineError`]

pub mod error;
pub mod invoker;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod task_source;
pub mod verifier;

pub use error::EngineError;
pub use invoker::{CommandInvoker, GenerationInvoker, GenerationOutcome};
pub use orchestrator::{BatchReport, HaltReason, Orchestrator, RunSummary};
pub use policy::{Admission, RetryPolicy};
pub use task_source::{JsonTaskSource, MemoryTaskSource, TaskSource};
pub use verifier::{CommandRunner, VerificationReport, VerificationRunner};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter; calling twice is harmless.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
