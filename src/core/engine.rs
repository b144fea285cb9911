//! Engine facade: owns the poller thread, exposes status, deletion and backfill

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use crossbeam::channel::{self, Sender};
use serde::Serialize;
use tracing::{info, warn};

use super::scheduler::{Scheduler, SchedulerStats, TickReport};
use crate::config::{Config, ConfigProvider, SharedConfig};
use crate::engine::{CustomEvaluator, DeviceStateStore, SampleGenerator, Strategies};
use crate::registry::{self, DeviceRegistry};
use crate::sinks::{SinkReport, SinkSet};

/// Samples handed to the sinks per batch during backfill
const BACKFILL_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub uptime_secs: u64,
    pub cached_devices: usize,
    pub device_states: usize,
    pub scheduler: SchedulerStats,
    pub sinks: Vec<SinkReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub device_id: String,
    pub samples: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    /// Sink deliveries that failed, summed over batches
    pub sink_failures: usize,
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Main fleetsim engine
pub struct Engine {
    scheduler: Scheduler,
    worker: Option<Worker>,
    started_at: Option<Instant>,
}

impl Engine {
    pub fn new(
        config: &Config,
        registry: Arc<dyn DeviceRegistry>,
        provider: Arc<dyn ConfigProvider>,
        sinks: SinkSet,
    ) -> Self {
        let generator = SampleGenerator::new(
            Arc::new(DeviceStateStore::new()),
            Strategies::new(),
            config.simulation.seed,
            config.simulation.physics_dt,
        );
        Self {
            scheduler: Scheduler::new(config.scheduler.clone(), registry, provider, generator, sinks),
            worker: None,
            started_at: None,
        }
    }

    /// Registry from the config file, the four built-in sinks, and a
    /// runtime-replaceable copy of the sink settings
    pub fn from_config(config: &Config) -> Result<(Self, SharedConfig)> {
        let registry: Arc<dyn DeviceRegistry> = Arc::from(registry::open(&config.registry)?);
        let shared = SharedConfig::new(config.sinks.clone());
        let engine = Self::new(config, registry, Arc::new(shared.clone()), SinkSet::standard());
        Ok((engine, shared))
    }

    /// Evaluators must be registered before `start`
    pub fn register_custom(&mut self, name: &str, evaluator: Arc<dyn CustomEvaluator>) -> Result<()> {
        let generator = self
            .scheduler
            .generator_mut()
            .ok_or_else(|| anyhow!("cannot register evaluator {} while the engine is running", name))?;
        generator.register_custom(name, evaluator);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            bail!("engine already running");
        }
        info!("Starting fleetsim engine...");

        let (stop, stop_rx) = channel::bounded::<()>(0);
        let scheduler = self.scheduler.clone();
        let handle = thread::Builder::new()
            .name("fleetsim-poller".to_string())
            .spawn(move || scheduler.run(stop_rx))?;

        self.worker = Some(Worker { stop, handle });
        self.started_at = Some(Instant::now());
        info!("fleetsim engine started");
        Ok(())
    }

    /// Request a stop and block until the current tick has finished
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        info!("Stopping fleetsim engine...");
        // Disconnecting wakes the poller out of its sleep
        drop(worker.stop);
        if worker.handle.join().is_err() {
            warn!("Poller thread panicked");
        }
        self.started_at = None;
        info!("fleetsim engine stopped");
    }

    /// Stop and release every sink connection and listener
    pub fn shutdown(&mut self) {
        self.stop();
        self.scheduler.sinks().lock().shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// One tick on the calling thread, for embedding without the poller
    pub fn tick_once(&self) -> TickReport {
        self.scheduler.tick()
    }

    /// Clear engine state for a device removed from the registry
    pub fn notify_deleted(&self, device_id: &str) {
        self.scheduler.forget(device_id);
    }

    pub fn state_store(&self) -> Arc<DeviceStateStore> {
        self.scheduler.generator().store().clone()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: if self.is_running() { EngineState::Running } else { EngineState::Stopped },
            uptime_secs: self.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            cached_devices: self.scheduler.cached_devices(),
            device_states: self.scheduler.generator().store().len(),
            scheduler: self.scheduler.stats(),
            sinks: self.scheduler.sinks().lock().reports(),
        }
    }

    /// Synthesize `count` historical samples `step` apart starting at `start`
    /// and push them through every enabled sink's batch path. Live device
    /// state is left untouched.
    pub fn backfill(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        step: Duration,
        count: usize,
    ) -> Result<BackfillReport> {
        if step <= Duration::zero() {
            bail!("backfill step must be positive");
        }

        let device = self
            .scheduler
            .registry()
            .list_running_devices()?
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| anyhow!("device {} not found among running devices", device_id))?;

        let mut sinks = self.scheduler.sinks().lock();
        sinks.reconcile(&self.scheduler.provider().sink_settings());

        let generator = self.scheduler.generator().detached();
        let samples = generator
            .generate_series(&device, start, step, count)
            .ok_or_else(|| anyhow!("backfill of {} sample(s) {} apart runs past the supported time range", count, step))?;
        let mut sink_failures = 0;
        for batch in samples.chunks(BACKFILL_BATCH) {
            sink_failures += sinks.dispatch_batch(&device, batch);
        }

        info!(
            "Backfilled {} sample(s) for {} with {} sink failure(s)",
            samples.len(),
            device_id,
            sink_failures
        );
        Ok(BackfillReport {
            device_id: device_id.to_string(),
            samples: samples.len(),
            first: samples.first().map(|s| s.timestamp),
            last: samples.last().map(|s| s.timestamp),
            sink_failures,
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
