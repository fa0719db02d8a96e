//! Netdrill Engine Library
//!
//! Simulation core for classroom network-operations drills: a scenario
//! scheduler mutating a live network state store, a metrics and anomaly
//! pipeline, and a hub pushing alerts and updates to teacher and student
//! sessions.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod pipeline;
mod ring;
pub mod scenario;
pub mod scheduler;
pub mod state;
pub mod timeseries;
pub mod topology;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::SimulationEngine;
pub use error::{Result, SimError};
pub use hub::{BroadcastHub, PushEvent};
pub use pipeline::MetricsPipeline;
pub use scheduler::ScenarioScheduler;
pub use state::NetworkStore;
pub use topology::Topology;
