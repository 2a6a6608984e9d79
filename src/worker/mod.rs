//! Workers: registry, per-worker memory and state, and the iteration loop.
//!
//! Core components:
//! - `context`: WorkerRegistry and per-worker handles
//! - `state`: status machine (idle, working, communicating, error)
//! - `memory`: append-only context memory rendered into prompts
//! - `worker`: the iteration controller and peer-message handling
//! - `scheduler`: background tasks and messages

pub mod activity;
pub mod context;
pub mod memory;
pub mod prompts;
pub mod role;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use activity::{ActivityEntry, WorkerActivity};
pub use context::{WorkerRecord, WorkerRegistry, WorkerSpec, WorkerSummary, WorkerUpdate};
pub use memory::ContextMemory;
pub use role::WorkerRole;
pub use scheduler::Scheduler;
pub use state::WorkerStatus;
pub use worker::{
    MessageOutcome, TaskCompletion, TaskOptions, TaskOutcome, TaskRequest, Worker, WorkerDeps,
};
