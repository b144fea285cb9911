//! Simulation engine - signal synthesis for a single device tick

pub mod expr;
pub mod faults;
pub mod generator;
pub mod logic;
pub mod physics;
pub mod state;
pub mod strategies;

pub use expr::{Expr, ExprError};
pub use faults::{ErrorContext, ErrorInjector};
pub use generator::SampleGenerator;
pub use logic::LogicEngine;
pub use physics::{PhysicsEngine, PhysicsState};
pub use state::{DeviceState, DeviceStateStore};
pub use strategies::{CustomEvaluator, GenerationState, Strategies, Strategy};
