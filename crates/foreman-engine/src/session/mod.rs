//! Work-session supervision.
//!
//! A work session is the live mapping between a logical conversation and a
//! spawned assistant subprocess, at most one per project (per thread when no
//! project applies). The supervisor owns the in-memory registry, drives
//! turns, and bridges the subprocess protocol onto the event relay.

mod bridge;
mod supervisor;
mod types;

pub(crate) use bridge::TurnBridge;
pub use supervisor::WorkSessionSupervisor;
pub use types::{AgentIdle, StartSession, SupervisorConfig, WorkSession, session_key};
