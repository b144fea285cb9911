// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Polling loop: refresh the registry, tick every running device, fan out

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigProvider, SchedulerConfig};
use crate::engine::SampleGenerator;
use crate::model::Device;
use crate::registry::DeviceRegistry;
use crate::sinks::SinkSet;

/// Last registry snapshot, refreshed once it is older than the TTL
#[derive(Debug)]
pub struct DeviceCache {
    devices: Vec<Device>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl DeviceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            devices: Vec::new(),
            fetched_at: None,
            ttl,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        match self.fetched_at {
            Some(at) => now.duration_since(at) >= self.ttl,
            None => true,
        }
    }

    pub fn replace(&mut self, devices: Vec<Device>, now: Instant) {
        self.devices = devices;
        self.fetched_at = Some(now);
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn remove(&mut self, device_id: &str) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.id != device_id);
        self.devices.len() != before
    }

    pub fn invalidate(&mut self) {
        self.fetched_at = None;
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Counters since the engine was created
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub samples_generated: u64,
    pub dispatch_failures: u64,
    pub registry_errors: u64,
    pub last_registry_error: Option<String>,
    pub devices_last_tick: usize,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_ms: u64,
    /// Generation or dispatch failures per device id
    pub device_failures: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub devices: usize,
    pub samples: usize,
    pub failures: usize,
}

/// Everything one tick needs. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<dyn DeviceRegistry>,
    provider: Arc<dyn ConfigProvider>,
    generator: Arc<SampleGenerator>,
    sinks: Arc<Mutex<SinkSet>>,
    cache: Arc<Mutex<DeviceCache>>,
    stats: Arc<RwLock<SchedulerStats>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn DeviceRegistry>,
        provider: Arc<dyn ConfigProvider>,
        generator: SampleGenerator,
        sinks: SinkSet,
    ) -> Self {
        let ttl = Duration::from_secs(config.registry_ttl_secs);
        Self {
            registry,
            provider,
            generator: Arc::new(generator),
            sinks: Arc::new(Mutex::new(sinks)),
            cache: Arc::new(Mutex::new(DeviceCache::new(ttl))),
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn ConfigProvider> {
        &self.provider
    }

    pub fn generator(&self) -> &Arc<SampleGenerator> {
        &self.generator
    }

    /// Exclusive access, only available while no worker holds a clone
    pub fn generator_mut(&mut self) -> Option<&mut SampleGenerator> {
        Arc::get_mut(&mut self.generator)
    }

    pub fn sinks(&self) -> &Arc<Mutex<SinkSet>> {
        &self.sinks
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.read().clone()
    }

    pub fn cached_devices(&self) -> usize {
        self.cache.lock().len()
    }

    /// Reconcile sinks, refresh devices if the cache is stale, then generate
    /// and dispatch one sample per running device
    pub fn tick(&self) -> TickReport {
        let started = Instant::now();
        self.sinks.lock().reconcile(&self.provider.sink_settings());

        let devices = self.refresh();
        let mut report = TickReport {
            devices: devices.len(),
            ..TickReport::default()
        };
        let mut failed_devices = Vec::new();

        for device in devices.iter().filter(|d| d.is_running()) {
            let generated = panic::catch_unwind(AssertUnwindSafe(|| self.generator.generate(device, None)));
            let sample = match generated {
                Ok(sample) => sample,
                Err(_) => {
                    error!("Sample generation panicked for device {}", device.id);
                    report.failures += 1;
                    failed_devices.push(device.id.clone());
                    continue;
                }
            };
            report.samples += 1;

            let failures = self.sinks.lock().dispatch(device, &sample);
            if failures > 0 {
                report.failures += failures;
                failed_devices.push(device.id.clone());
            }
        }

        let mut stats = self.stats.write();
        stats.ticks += 1;
        stats.samples_generated += report.samples as u64;
        stats.dispatch_failures += report.failures as u64;
        stats.devices_last_tick = report.devices;
        stats.last_tick_at = Some(Utc::now());
        stats.last_tick_ms = started.elapsed().as_millis() as u64;
        for id in failed_devices {
            *stats.device_failures.entry(id).or_insert(0) += 1;
        }
        debug!(
            "Tick {}: {} device(s), {} sample(s), {} failure(s) in {} ms",
            stats.ticks, report.devices, report.samples, report.failures, stats.last_tick_ms
        );
        report
    }

    fn refresh(&self) -> Vec<Device> {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        if !cache.is_stale(now) {
            return cache.devices().to_vec();
        }

        match self.registry.list_running_devices() {
            Ok(devices) => {
                if devices.len() != cache.len() {
                    info!("Registry lists {} running device(s)", devices.len());
                }
                cache.replace(devices, now);
            }
            Err(e) => {
                warn!("Registry refresh failed, keeping {} cached device(s): {:#}", cache.len(), e);
                let mut stats = self.stats.write();
                stats.registry_errors += 1;
                stats.last_registry_error = Some(format!("{:#}", e));
            }
        }
        drop(cache);

        for device_id in self.registry.take_deleted() {
            self.forget(&device_id);
        }
        self.cache.lock().devices().to_vec()
    }

    /// Drop all engine-side state for a deleted device
    pub fn forget(&self, device_id: &str) {
        let had_state = self.generator.store().clear(device_id);
        self.cache.lock().remove(device_id);
        self.sinks.lock().forget(device_id);
        self.stats.write().device_failures.remove(device_id);
        if had_state {
            info!("Cleared simulation state for deleted device {}", device_id);
        }
    }

    /// Tick until `stop` fires or its sender is dropped. A tick in progress
    /// always completes.
    pub fn run(self, stop: Receiver<()>) {
        let interval = Duration::from_millis(self.config.interval_ms);
        let min_sleep = Duration::from_millis(self.config.min_sleep_ms);
        info!("Poller started, interval {:?}", interval);

        loop {
            let started = Instant::now();
            self.tick();

            let sleep = interval.saturating_sub(started.elapsed()).max(min_sleep);
            match stop.recv_timeout(sleep) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkSettings;
    use crate::engine::{DeviceStateStore, Strategies};
    use crate::model::{GeneratedSample, ParameterDefinition, ValueKind};
    use crate::registry::InMemoryRegistry;
    use crate::sinks::{Sink, SinkError, SinkKind, SinkStatus};

    struct Counting {
        seen: Arc<Mutex<Vec<String>>>,
        fail_for: Option<&'static str>,
    }

    impl Sink for Counting {
        fn kind(&self) -> SinkKind {
            SinkKind::PubSub
        }

        fn configure(&mut self, _settings: &SinkSettings) -> SinkStatus {
            SinkStatus::Connected
        }

        fn dispatch(&mut self, device: &Device, _sample: &GeneratedSample) -> Result<(), SinkError> {
            if self.fail_for == Some(device.id.as_str()) {
                return Err(SinkError::Transport("boom".into()));
            }
            self.seen.lock().push(device.id.clone());
            Ok(())
        }

        fn status(&self) -> SinkStatus {
            SinkStatus::Connected
        }
    }

    fn scheduler(registry: Arc<InMemoryRegistry>, fail_for: Option<&'static str>) -> (Scheduler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sinks = SinkSet::new();
        sinks.push(Box::new(Counting {
            seen: seen.clone(),
            fail_for,
        }));
        let generator = SampleGenerator::new(Arc::new(DeviceStateStore::new()), Strategies::new(), Some(1), 1.0);
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            registry,
            Arc::new(SinkSettings::default()),
            generator,
            sinks,
        );
        (scheduler, seen)
    }

    fn device(id: &str) -> Device {
        Device::new(id, "pump").with_parameter(ParameterDefinition::new("flow", ValueKind::Number))
    }

    #[test]
    fn test_failing_device_does_not_block_others() {
        let registry = Arc::new(InMemoryRegistry::with_devices(vec![device("a"), device("b"), device("c")]));
        let (scheduler, seen) = scheduler(registry, Some("b"));

        let report = scheduler.tick();
        assert_eq!(report, TickReport { devices: 3, samples: 3, failures: 1 });
        assert_eq!(*seen.lock(), vec!["a".to_string(), "c".to_string()]);

        let stats = scheduler.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.device_failures.get("b"), Some(&1));
    }

    #[test]
    fn test_cache_hides_registry_changes_until_ttl() {
        let registry = Arc::new(InMemoryRegistry::with_devices(vec![device("a")]));
        let (scheduler, _) = scheduler(registry.clone(), None);

        scheduler.tick();
        registry.upsert(device("b"));
        assert_eq!(scheduler.tick().devices, 1);

        scheduler.cache.lock().invalidate();
        assert_eq!(scheduler.tick().devices, 2);
    }

    #[test]
    fn test_deleted_devices_lose_state() {
        let registry = Arc::new(InMemoryRegistry::with_devices(vec![device("a"), device("b")]));
        let (scheduler, _) = scheduler(registry.clone(), None);
        scheduler.tick();
        assert_eq!(scheduler.generator().store().len(), 2);

        registry.remove("a");
        scheduler.cache.lock().invalidate();
        let report = scheduler.tick();

        assert_eq!(report.devices, 1);
        assert!(scheduler.generator().store().get("a").is_none());
        assert_eq!(scheduler.generator().store().snapshot("b").unwrap().ticks, 2);
    }

    #[test]
    fn test_cache_staleness() {
        let mut cache = DeviceCache::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(cache.is_stale(now));
        cache.replace(vec![device("x")], now);
        assert!(!cache.is_stale(now + Duration::from_secs(4)));
        assert!(cache.is_stale(now + Duration::from_secs(5)));
        assert!(cache.remove("x"));
        assert!(cache.is_empty());
    }
}
