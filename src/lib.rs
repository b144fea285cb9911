// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! fleetsim - Industrial Device Fleet Simulator
//!
//! Synthesizes per-device time series for a fleet of simulated machines and
//! fans every sample out to several industrial destinations:
//! - Time-series store with per-category super tables and additive schema evolution
//! - MQTT publish/subscribe
//! - Modbus-style holding registers, optionally served over Modbus-TCP
//! - Node-graph address space with WebSocket browse/subscribe/write sessions
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        fleetsim Engine                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────────────────────────────────────┐ │
//! │  │ Registry │ → │ Scheduler (poller thread, TTL cache)      │ │
//! │  └──────────┘   └──────────────────────────────────────────┘ │
//! │                                  ↓                           │
//! │  ┌───────────────────────────────────────────────────────┐   │
//! │  │ Sample Generator                                       │   │
//! │  │  strategies → physics → rules → fault injection        │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! │                                  ↓                           │
//! │  ┌────────────┐  ┌────────┐  ┌──────────┐  ┌────────────┐    │
//! │  │ TimeSeries │  │ PubSub │  │ Fieldbus │  │ NodeGraph  │    │
//! │  └────────────┘  └────────┘  └──────────┘  └────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod model;
pub mod registry;
pub mod sinks;

// Re-exports for convenience
pub use config::{Config, ConfigProvider, SharedConfig};
pub use core::{BackfillReport, Engine, EngineStatus};
pub use model::{Device, GeneratedSample, ParameterDefinition, SampleValue};
pub use registry::DeviceRegistry;
pub use sinks::{Sink, SinkError, SinkSet, SinkStatus};

/// fleetsim version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// fleetsim name
pub const NAME: &str = "fleetsim";
