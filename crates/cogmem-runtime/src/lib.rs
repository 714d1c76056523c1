//! `cogmem-runtime` – Configuration, telemetry and engine wiring for hosts
//! embedding the memory engine.

pub mod config;
pub mod engine;
pub mod telemetry;

pub use config::{ConfigError, MemoryConfig};
pub use engine::{EngineError, MemoryEngine};
