// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Error injection: missingness, drift, anomalies and noise

use chrono::{DateTime, Utc};
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};

use crate::model::{AnomalyKind, ErrorConfig, ParameterDefinition, SampleValue};

const DEFAULT_ANOMALY_MULTIPLIER: f64 = 1.5;

/// Mutable per-parameter fault state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub drift_accumulated: f64,
    /// Start of the current drift window, measured on sample timestamps
    pub drift_window_start: Option<DateTime<Utc>>,
}

/// Applies the configured fault stages in order: MCAR, drift, anomaly, noise
pub struct ErrorInjector;

impl ErrorInjector {
    pub fn apply(
        value: SampleValue,
        parameter: &ParameterDefinition,
        context: &mut ErrorContext,
        now: DateTime<Utc>,
        rng: &mut dyn RngCore,
    ) -> SampleValue {
        let config = &parameter.error_config;
        if value.is_null() || config.is_empty() {
            return value;
        }

        if let Some(p) = config.mcar_probability {
            if rng.gen::<f64>() < p {
                return SampleValue::Null;
            }
        }

        let SampleValue::Number(mut number) = value else {
            return value;
        };

        if let Some(rate) = config.drift_rate {
            number += Self::drift(rate, config, context, now);
        }

        if let Some(p) = config.anomaly_probability {
            if rng.gen::<f64>() < p {
                number = Self::anomaly(number, config, parameter);
            }
        }

        if let Some(std_dev) = config.noise_std_dev.filter(|sd| *sd > 0.0) {
            if let Ok(normal) = Normal::new(0.0, std_dev) {
                number += normal.sample(rng);
            }
        }

        SampleValue::Number(number)
    }

    fn drift(rate: f64, config: &ErrorConfig, context: &mut ErrorContext, now: DateTime<Utc>) -> f64 {
        context.drift_accumulated += rate;

        if let Some(interval) = config.drift_reset_interval {
            let start = *context.drift_window_start.get_or_insert(now);
            let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
            if elapsed > interval {
                context.drift_accumulated = 0.0;
                context.drift_window_start = Some(now);
            }
        }

        context.drift_accumulated
    }

    fn anomaly(value: f64, config: &ErrorConfig, parameter: &ParameterDefinition) -> f64 {
        match config.anomaly_type.unwrap_or_default() {
            AnomalyKind::Spike => value * config.anomaly_multiplier.unwrap_or(DEFAULT_ANOMALY_MULTIPLIER),
            AnomalyKind::Drop => 0.0,
            AnomalyKind::Min => parameter.min_value.unwrap_or(0.0),
            AnomalyKind::Max => parameter.max_value.unwrap_or(value * 2.0),
        }
    }
}
