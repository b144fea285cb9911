//! Core module - the poller and the engine facade around it

mod engine;
mod scheduler;

pub use engine::{BackfillReport, Engine, EngineState, EngineStatus};
pub use scheduler::{DeviceCache, Scheduler, SchedulerStats, TickReport};
