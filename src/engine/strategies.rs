// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Generation strategies, one per generation mode

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use serde_json::{Map, Value};

use crate::model::{GenerationMode, ParameterDefinition, SampleValue, ValueKind};

const DEFAULT_MIN: f64 = 0.0;
const DEFAULT_MAX: f64 = 100.0;
const DEFAULT_PERIOD: f64 = 100.0;
const DEFAULT_STRING_LENGTH: usize = 10;

/// Running per-parameter state, seeded once from the static generation params
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationState {
    /// LINEAR / RANDOM_WALK position
    pub current_value: Option<f64>,
    /// LINEAR step; its sign flips on bounce
    pub step: f64,
    /// RANDOM_WALK max perturbation
    pub step_range: Option<f64>,
    /// PERIODIC tick counter
    pub time: u64,
    pub period: f64,
    pub amplitude: Option<f64>,
    pub offset: Option<f64>,
    /// RANDOM string length
    pub length: usize,
    /// Private copy of the generation params for custom evaluators
    pub params: Map<String, Value>,
}

impl GenerationState {
    pub fn seed(parameter: &ParameterDefinition) -> Self {
        let params = parameter.generation_params.clone();
        let number = |key: &str| params.get(key).and_then(Value::as_f64);

        let period = number("period").filter(|p| p.is_finite() && *p != 0.0).unwrap_or(DEFAULT_PERIOD);
        let length = params
            .get("length")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_STRING_LENGTH);

        Self {
            current_value: number("current_value"),
            step: number("step").unwrap_or(1.0),
            step_range: number("step_range"),
            time: params.get("time").and_then(Value::as_u64).unwrap_or(0),
            period,
            amplitude: number("amplitude"),
            offset: number("offset"),
            length,
            params,
        }
    }
}

/// Maps a parameter definition and its running state to a new value
pub trait Strategy: Send + Sync {
    fn generate(
        &self,
        parameter: &ParameterDefinition,
        state: &mut GenerationState,
        rng: &mut dyn RngCore,
    ) -> SampleValue;
}

/// User-pluggable logic behind the CUSTOM mode, selected by the `evaluator` generation param
pub trait CustomEvaluator: Send + Sync {
    fn evaluate(
        &self,
        parameter: &ParameterDefinition,
        state: &mut GenerationState,
        rng: &mut dyn RngCore,
    ) -> SampleValue;
}

/// Uniform draw within bounds (0..100 when unset), coin flip, or alphanumeric string
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn generate(
        &self,
        parameter: &ParameterDefinition,
        state: &mut GenerationState,
        rng: &mut dyn RngCore,
    ) -> SampleValue {
        match parameter.kind {
            ValueKind::Number => {
                let min = parameter.min_value.unwrap_or(DEFAULT_MIN);
                let max = parameter.max_value.unwrap_or(DEFAULT_MAX);
                SampleValue::Number(uniform(rng, min, max))
            }
            ValueKind::Boolean => SampleValue::Bool(rng.gen_bool(0.5)),
            ValueKind::String => {
                let text: String = (0..state.length)
                    .map(|_| char::from(rng.sample(Alphanumeric)))
                    .collect();
                SampleValue::Text(text)
            }
        }
    }
}

/// Constant-step ramp that bounces between min and max.
///
/// With only one bound configured there is nothing to bounce between and the
/// value advances without limit.
pub struct LinearStrategy;

impl Strategy for LinearStrategy {
    fn generate(
        &self,
        parameter: &ParameterDefinition,
        state: &mut GenerationState,
        _rng: &mut dyn RngCore,
    ) -> SampleValue {
        let current = state.current_value.unwrap_or_else(|| parameter.initial_numeric());
        let mut next = current + state.step;

        if let Some((min, max)) = parameter.bounds() {
            if next > max || next < min {
                state.step = -state.step;
                next = current + state.step;
            }
        }

        state.current_value = Some(next);
        SampleValue::Number(next)
    }
}

/// Sine wave over a tick counter
pub struct PeriodicStrategy;

impl Strategy for PeriodicStrategy {
    fn generate(
        &self,
        parameter: &ParameterDefinition,
        state: &mut GenerationState,
        _rng: &mut dyn RngCore,
    ) -> SampleValue {
        let min = parameter.min_value.unwrap_or(DEFAULT_MIN);
        let max = parameter.max_value.unwrap_or(DEFAULT_MAX);
        let amplitude = state.amplitude.unwrap_or((max - min) / 2.0);
        let offset = state.offset.unwrap_or((min + max) / 2.0);

        let phase = 2.0 * PI * state.time as f64 / state.period;
        state.time += 1;

        SampleValue::Number(offset + amplitude * phase.sin())
    }
}

/// Bounded random increments, clamped to whichever bounds are set
pub struct RandomWalkStrategy;

impl Strategy for RandomWalkStrategy {
    fn generate(
        &self,
        parameter: &ParameterDefinition,
        state: &mut GenerationState,
        rng: &mut dyn RngCore,
    ) -> SampleValue {
        let current = state.current_value.unwrap_or_else(|| parameter.initial_numeric());
        let step_range = state.step_range.unwrap_or_else(|| match parameter.bounds() {
            Some((min, max)) if max != min => (max - min).abs() * 0.01,
            _ => 1.0,
        });

        let change = if step_range.is_finite() && step_range > 0.0 {
            rng.gen_range(-step_range..=step_range)
        } else {
            0.0
        };

        let mut next = current + change;
        if let Some(min) = parameter.min_value {
            next = next.max(min);
        }
        if let Some(max) = parameter.max_value {
            next = next.min(max);
        }

        state.current_value = Some(next);
        SampleValue::Number(next)
    }
}

/// Placeholder for CUSTOM parameters without a registered evaluator
pub struct DefaultValueStrategy;

impl Strategy for DefaultValueStrategy {
    fn generate(
        &self,
        parameter: &ParameterDefinition,
        _state: &mut GenerationState,
        _rng: &mut dyn RngCore,
    ) -> SampleValue {
        if let Some(default) = &parameter.default_value {
            let value = SampleValue::from_json(default);
            if !value.is_null() {
                return value;
            }
        }
        SampleValue::Number(parameter.min_value.unwrap_or(0.0))
    }
}

/// Strategy table plus the registered custom evaluators
#[derive(Clone, Default)]
pub struct Strategies {
    custom: HashMap<String, Arc<dyn CustomEvaluator>>,
}

impl Strategies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_custom(&mut self, name: &str, evaluator: Arc<dyn CustomEvaluator>) {
        self.custom.insert(name.to_string(), evaluator);
    }

    pub fn strategy_for(mode: GenerationMode) -> &'static dyn Strategy {
        match mode {
            GenerationMode::Random => &RandomStrategy,
            GenerationMode::Linear => &LinearStrategy,
            GenerationMode::Periodic => &PeriodicStrategy,
            GenerationMode::RandomWalk => &RandomWalkStrategy,
            GenerationMode::Custom => &DefaultValueStrategy,
        }
    }

    pub fn generate(
        &self,
        parameter: &ParameterDefinition,
        state: &mut GenerationState,
        rng: &mut dyn RngCore,
    ) -> SampleValue {
        if parameter.generation_mode == GenerationMode::Custom {
            let evaluator = state
                .params
                .get("evaluator")
                .and_then(Value::as_str)
                .and_then(|name| self.custom.get(name))
                .cloned();
            if let Some(evaluator) = evaluator {
                return evaluator.evaluate(parameter, state, rng);
            }
        }
        Self::strategy_for(parameter.generation_mode).generate(parameter, state, rng)
    }
}

fn uniform(rng: &mut dyn RngCore, a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if lo == hi || !lo.is_finite() || !hi.is_finite() {
        return lo;
    }
    rng.gen_range(lo..=hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    fn number(v: SampleValue) -> f64 {
        v.as_f64().expect("numeric value")
    }

    #[test]
    fn test_random_respects_bounds_and_defaults() {
        let mut rng = rng();
        let bounded = ParameterDefinition::new("p", ValueKind::Number).with_bounds(10.0, 20.0);
        let unbounded = ParameterDefinition::new("q", ValueKind::Number);
        let mut s1 = GenerationState::seed(&bounded);
        let mut s2 = GenerationState::seed(&unbounded);

        for _ in 0..500 {
            let a = number(RandomStrategy.generate(&bounded, &mut s1, &mut rng));
            let b = number(RandomStrategy.generate(&unbounded, &mut s2, &mut rng));
            assert!((10.0..=20.0).contains(&a));
            assert!((0.0..=100.0).contains(&b));
        }
    }

    #[test]
    fn test_random_string_length() {
        let mut rng = rng();
        let p = ParameterDefinition::new("serial", ValueKind::String).with_param("length", 16);
        let mut state = GenerationState::seed(&p);
        match RandomStrategy.generate(&p, &mut state, &mut rng) {
            SampleValue::Text(s) => {
                assert_eq!(s.len(), 16);
                assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_linear_bounces_at_max() {
        let mut rng = rng();
        let p = ParameterDefinition::new("p", ValueKind::Number)
            .with_bounds(0.0, 10.0)
            .with_mode(GenerationMode::Linear)
            .with_param("step", 1.0);
        let mut state = GenerationState::seed(&p);

        let mut values = Vec::new();
        for _ in 0..12 {
            values.push(number(LinearStrategy.generate(&p, &mut state, &mut rng)));
        }

        let peak = values.iter().position(|v| *v == 10.0).expect("reaches max");
        assert!(values[peak + 1] < 10.0);
        assert_eq!(values[peak + 1], 9.0);
        assert!(values.iter().all(|v| (0.0..=10.0).contains(v)));
    }

    #[test]
    fn test_linear_single_bound_grows_unbounded() {
        let mut rng = rng();
        let mut p = ParameterDefinition::new("p", ValueKind::Number).with_mode(GenerationMode::Linear);
        p.max_value = Some(3.0);
        let mut state = GenerationState::seed(&p);

        let last = (0..10)
            .map(|_| number(LinearStrategy.generate(&p, &mut state, &mut rng)))
            .last()
            .unwrap();
        assert_eq!(last, 10.0);
    }

    #[test]
    fn test_periodic_returns_after_full_period() {
        let mut rng = rng();
        let p = ParameterDefinition::new("p", ValueKind::Number)
            .with_bounds(0.0, 50.0)
            .with_mode(GenerationMode::Periodic)
            .with_param("period", 20);
        let mut state = GenerationState::seed(&p);

        let first = number(PeriodicStrategy.generate(&p, &mut state, &mut rng));
        for _ in 1..20 {
            PeriodicStrategy.generate(&p, &mut state, &mut rng);
        }
        let wrapped = number(PeriodicStrategy.generate(&p, &mut state, &mut rng));

        assert!((first - 25.0).abs() < 1e-9);
        assert!((first - wrapped).abs() < 1e-9);
    }

    #[test]
    fn test_random_walk_stays_in_bounds() {
        let mut rng = rng();
        let p = ParameterDefinition::new("p", ValueKind::Number)
            .with_bounds(-5.0, 5.0)
            .with_mode(GenerationMode::RandomWalk)
            .with_param("step_range", 3.0);
        let mut state = GenerationState::seed(&p);

        for _ in 0..2000 {
            let v = number(RandomWalkStrategy.generate(&p, &mut state, &mut rng));
            assert!((-5.0..=5.0).contains(&v));
        }
    }

    struct Counter;

    impl CustomEvaluator for Counter {
        fn evaluate(
            &self,
            _parameter: &ParameterDefinition,
            state: &mut GenerationState,
            _rng: &mut dyn RngCore,
        ) -> SampleValue {
            state.time += 1;
            SampleValue::Number(state.time as f64)
        }
    }

    #[test]
    fn test_custom_uses_registered_evaluator() {
        let mut rng = rng();
        let mut strategies = Strategies::new();
        strategies.register_custom("counter", Arc::new(Counter));

        let wired = ParameterDefinition::new("c", ValueKind::Number)
            .with_mode(GenerationMode::Custom)
            .with_param("evaluator", "counter");
        let fallback = ParameterDefinition::new("d", ValueKind::Number)
            .with_mode(GenerationMode::Custom)
            .with_default(42);

        let mut s1 = GenerationState::seed(&wired);
        let mut s2 = GenerationState::seed(&fallback);
        strategies.generate(&wired, &mut s1, &mut rng);
        assert_eq!(strategies.generate(&wired, &mut s1, &mut rng), SampleValue::Number(2.0));
        assert_eq!(strategies.generate(&fallback, &mut s2, &mut rng), SampleValue::Number(42.0));
    }
}
