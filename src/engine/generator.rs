// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Per-tick sample synthesis for one device

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{trace, warn};

use super::faults::ErrorInjector;
use super::logic::{is_identifier, LogicEngine};
use super::physics::PhysicsEngine;
use super::state::DeviceStateStore;
use super::strategies::{CustomEvaluator, GenerationState, Strategies};
use crate::model::{Device, GeneratedSample, ParameterDefinition, SampleValue};

/// Runs strategies, physics, rules and fault injection for a device
pub struct SampleGenerator {
    store: Arc<DeviceStateStore>,
    strategies: Strategies,
    rng: Mutex<ChaCha8Rng>,
    physics_dt: f64,
}

impl SampleGenerator {
    /// A `seed` makes the whole fleet reproducible
    pub fn new(store: Arc<DeviceStateStore>, strategies: Strategies, seed: Option<u64>, physics_dt: f64) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            store,
            strategies,
            rng: Mutex::new(rng),
            physics_dt,
        }
    }

    pub fn store(&self) -> &Arc<DeviceStateStore> {
        &self.store
    }

    pub fn register_custom(&mut self, name: &str, evaluator: Arc<dyn CustomEvaluator>) {
        self.strategies.register_custom(name, evaluator);
    }

    /// Same strategies over an empty state store, for synthesizing history
    /// without disturbing live per-device state
    pub fn detached(&self) -> SampleGenerator {
        let seed = self.rng.lock().next_u64();
        SampleGenerator {
            store: Arc::new(DeviceStateStore::new()),
            strategies: self.strategies.clone(),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            physics_dt: self.physics_dt,
        }
    }

    /// Produce one sample. `timestamp` defaults to now and is bumped forward
    /// if it would not be strictly after the device's previous sample.
    pub fn generate(&self, device: &Device, timestamp: Option<DateTime<Utc>>) -> GeneratedSample {
        let handle = self.store.get_or_create(&device.id);
        let mut guard = handle.lock();
        let state = &mut *guard;
        let mut rng = self.rng.lock();

        let mut timestamp = timestamp.unwrap_or_else(Utc::now);
        if let Some(last) = state.last_timestamp {
            if timestamp <= last {
                timestamp = last.checked_add_signed(Duration::milliseconds(1)).unwrap_or(last);
            }
        }
        state.last_timestamp = Some(timestamp);

        let mut working: HashMap<String, SampleValue> = HashMap::with_capacity(device.parameters.len() + 2);
        for parameter in &device.parameters {
            let generation = state
                .parameter_states
                .entry(parameter.id.clone())
                .or_insert_with(|| GenerationState::seed(parameter));
            let value = self.strategies.generate(parameter, generation, &mut *rng);
            working.insert(parameter.id.clone(), value);
        }
        let generated = working.clone();

        // Rules may refer to parameters by display name as well as by id
        let mut aliases: HashMap<String, String> = HashMap::new();
        for parameter in &device.parameters {
            let name = parameter.name.trim();
            if name != parameter.id && is_identifier(name) && !working.contains_key(name) {
                aliases.insert(name.to_string(), parameter.id.clone());
            }
        }
        for (alias, id) in &aliases {
            if let Some(value) = working.get(id).cloned() {
                working.insert(alias.clone(), value);
            }
        }

        if device.physics_config.is_configured() {
            state.physics_state = PhysicsEngine::update(state.physics_state, &device.physics_config, self.physics_dt);
            working.insert("position".to_string(), SampleValue::Number(state.physics_state.position));
            working.insert("velocity".to_string(), SampleValue::Number(state.physics_state.velocity));
        }

        if !device.logic_rules.is_empty() {
            let updates = LogicEngine::evaluate(&working, &device.logic_rules);
            for (target, value) in updates {
                if let Some(id) = aliases.get(&target) {
                    working.insert(id.clone(), value.clone());
                }
                working.insert(target, value);
            }
        }

        let mut data = BTreeMap::new();
        for parameter in &device.parameters {
            let raw = working.get(&parameter.id).cloned().unwrap_or(SampleValue::Null);
            let value = coerce_or_fallback(raw, parameter, generated.get(&parameter.id), &device.id);
            let context = state.error_context.entry(parameter.id.clone()).or_default();
            let value = ErrorInjector::apply(value, parameter, context, timestamp, &mut *rng);
            data.insert(parameter.id.clone(), value);
        }

        state.ticks += 1;
        trace!("generated sample #{} for {}", state.ticks, device.id);

        GeneratedSample {
            device_id: device.id.clone(),
            timestamp,
            data,
        }
    }

    /// Synthesize `count` consecutive samples starting at `start`, `step` apart.
    /// Returns `None` if the last timestamp falls outside the representable range.
    pub fn generate_series(
        &self,
        device: &Device,
        start: DateTime<Utc>,
        step: Duration,
        count: usize,
    ) -> Option<Vec<GeneratedSample>> {
        let timestamps = series_timestamps(start, step, count)?;
        Some(timestamps.into_iter().map(|t| self.generate(device, Some(t))).collect())
    }
}

/// Coerce `raw` to the parameter's kind. A non-null value that does not
/// convert falls back to the strategy output for this tick, so only fault
/// injection ever produces a null.
fn coerce_or_fallback(
    raw: SampleValue,
    parameter: &ParameterDefinition,
    generated: Option<&SampleValue>,
    device_id: &str,
) -> SampleValue {
    if raw.is_null() {
        return raw;
    }
    let shown = raw.to_string();
    let value = raw.coerce(parameter.kind);
    if !value.is_null() {
        return value;
    }

    warn!(
        "Device {}: value {:?} is not a valid {:?} for {}, keeping the generated value",
        device_id, shown, parameter.kind, parameter.id
    );
    match generated.cloned().map(|v| v.coerce(parameter.kind)) {
        Some(v) if !v.is_null() => v,
        _ => SampleValue::Number(parameter.initial_numeric()),
    }
}

/// `start`, `start + step`, ... for `count` entries, or `None` on overflow
pub fn series_timestamps(start: DateTime<Utc>, step: Duration, count: usize) -> Option<Vec<DateTime<Utc>>> {
    let mut timestamps = Vec::with_capacity(count.min(1 << 16));
    let mut next = start;
    for i in 0..count {
        timestamps.push(next);
        if i + 1 < count {
            next = next.checked_add_signed(step)?;
        }
    }
    Some(timestamps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorConfig, GenerationMode, ParameterDefinition, PhysicsConfig, ValueKind};
    use chrono::TimeZone;

    fn generator() -> SampleGenerator {
        SampleGenerator::new(Arc::new(DeviceStateStore::new()), Strategies::new(), Some(7), 1.0)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_one_entry_per_parameter() {
        let device = Device::new("press-1", "press")
            .with_parameter(ParameterDefinition::new("force", ValueKind::Number).with_bounds(0.0, 10.0))
            .with_parameter(ParameterDefinition::new("running", ValueKind::Boolean))
            .with_parameter(ParameterDefinition::new("site", ValueKind::String).with_default("hall-2").as_tag());

        let sample = generator().generate(&device, Some(t0()));
        assert_eq!(sample.device_id, "press-1");
        assert_eq!(sample.timestamp, t0());
        assert_eq!(sample.data.len(), 3);
        assert!(matches!(sample.get("running"), Some(SampleValue::Bool(_))));
        assert!(matches!(sample.get("site"), Some(SampleValue::Text(_))));
    }

    #[test]
    fn test_state_persists_across_ticks() {
        let device = Device::new("d", "line").with_parameter(
            ParameterDefinition::new("count", ValueKind::Number)
                .with_bounds(0.0, 1000.0)
                .with_mode(GenerationMode::Linear)
                .with_param("step", 5.0),
        );
        let gen = generator();
        let values: Vec<f64> = gen
            .generate_series(&device, t0(), Duration::seconds(1), 3)
            .unwrap()
            .iter()
            .map(|s| s.get("count").and_then(SampleValue::as_f64).unwrap())
            .collect();
        assert_eq!(values, vec![5.0, 10.0, 15.0]);
        assert_eq!(device.parameters[0].generation_params.get("current_value"), None);
    }

    #[test]
    fn test_rules_override_before_fault_injection() {
        let device = Device::new("boiler", "boiler")
            .with_parameter(ParameterDefinition::new("temp", ValueKind::Number).with_bounds(200.0, 300.0))
            .with_parameter(
                ParameterDefinition::new("alarm", ValueKind::Boolean).with_errors(ErrorConfig {
                    mcar_probability: Some(0.0),
                    ..Default::default()
                }),
            )
            .with_rule("temp > 150", "alarm = 1");

        let sample = generator().generate(&device, Some(t0()));
        assert_eq!(sample.get("alarm"), Some(&SampleValue::Bool(true)));
    }

    #[test]
    fn test_non_numeric_rule_value_keeps_generated_number() {
        let device = Device::new("oven", "oven")
            .with_parameter(ParameterDefinition::new("x", ValueKind::Number).with_bounds(10.0, 20.0))
            .with_parameter(
                ParameterDefinition::new("fixed", ValueKind::Number)
                    .with_mode(GenerationMode::Custom)
                    .with_default("lukewarm")
                    .with_bounds(3.0, 9.0),
            )
            .with_rule("true", "x = 'warm'")
            .with_rule("true", "fixed = 'hot'");

        let gen = generator();
        for _ in 0..20 {
            let sample = gen.generate(&device, None);
            let x = sample.get("x").and_then(SampleValue::as_f64).unwrap();
            assert!((10.0..=20.0).contains(&x));
            assert_eq!(sample.get("fixed"), Some(&SampleValue::Number(3.0)));
        }
    }

    #[test]
    fn test_rules_can_use_display_names_and_physics() {
        let mut speed = ParameterDefinition::new("p_speed", ValueKind::Number).with_default(0);
        speed.name = "speed".to_string();
        speed.generation_mode = GenerationMode::Custom;

        let device = Device::new("agv", "agv")
            .with_parameter(speed)
            .with_parameter(ParameterDefinition::new("position", ValueKind::Number).with_bounds(-1.0, -1.0))
            .with_physics(PhysicsConfig {
                acceleration: Some(2.0),
                target_position: Some(50.0),
                ..Default::default()
            })
            .with_rule("velocity > 0", "speed = velocity * 10");

        let sample = generator().generate(&device, Some(t0()));
        assert_eq!(sample.get("p_speed"), Some(&SampleValue::Number(20.0)));
        assert_eq!(sample.get("position"), Some(&SampleValue::Number(2.0)));
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let device = Device::new("d", "c").with_parameter(ParameterDefinition::new("v", ValueKind::Number));
        let gen = generator();
        let first = gen.generate(&device, Some(t0()));
        let second = gen.generate(&device, Some(t0()));
        let third = gen.generate(&device, Some(t0() - Duration::seconds(5)));
        assert!(first.timestamp < second.timestamp);
        assert!(second.timestamp < third.timestamp);
    }

    #[test]
    fn test_detached_generator_leaves_live_state_alone() {
        let device = Device::new("d", "c").with_parameter(ParameterDefinition::new("v", ValueKind::Number));
        let gen = generator();
        gen.generate(&device, Some(t0()));

        let history = gen
            .detached()
            .generate_series(&device, t0() - Duration::hours(1), Duration::minutes(1), 5)
            .unwrap();
        assert_eq!(history[0].timestamp, t0() - Duration::hours(1));
        assert_eq!(history[4].timestamp, t0() - Duration::minutes(56));
        assert_eq!(gen.store().snapshot("d").unwrap().ticks, 1);
    }

    #[test]
    fn test_seeded_generators_agree() {
        let device = Device::new("d", "c")
            .with_parameter(ParameterDefinition::new("v", ValueKind::Number).with_mode(GenerationMode::RandomWalk));
        let a = generator().generate_series(&device, t0(), Duration::seconds(1), 20).unwrap();
        let b = generator().generate_series(&device, t0(), Duration::seconds(1), 20).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_series_past_the_calendar_is_refused() {
        let device = Device::new("d", "c").with_parameter(ParameterDefinition::new("v", ValueKind::Number));
        let gen = generator();
        assert!(gen.generate_series(&device, t0(), Duration::days(365_000), 1000).is_none());
        assert!(gen.store().get("d").is_none());

        let stamps = series_timestamps(t0(), Duration::days(365_000), 3).unwrap();
        assert_eq!(stamps[2], t0() + Duration::days(730_000));
        assert!(series_timestamps(t0(), Duration::days(365_000), 0).unwrap().is_empty());
    }
}
