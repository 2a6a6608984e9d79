//! Worker Swarm: autonomous LLM workers that write, run, and fix code.

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod safety;
pub mod swarm;
pub mod telemetry;
pub mod tools;
pub mod worker;

pub use error::{Error, Result};
pub use swarm::{ApprovedExecution, Swarm, SwarmBuilder};
