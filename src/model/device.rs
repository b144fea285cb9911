// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Device and parameter definitions as supplied by the device registry

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value kind of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    #[serde(alias = "number", alias = "数值")]
    Number,
    #[serde(alias = "boolean", alias = "布尔")]
    Boolean,
    #[serde(alias = "string", alias = "字符串")]
    String,
}

/// How a parameter's values are synthesized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationMode {
    #[default]
    #[serde(alias = "random")]
    Random,
    #[serde(alias = "linear")]
    Linear,
    #[serde(alias = "periodic")]
    Periodic,
    #[serde(alias = "random_walk")]
    RandomWalk,
    #[serde(alias = "custom")]
    Custom,
}

/// Device run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    #[serde(alias = "running")]
    Running,
    #[default]
    #[serde(alias = "stopped")]
    Stopped,
    #[serde(alias = "error")]
    Error,
}

/// Kind of distortion applied when an anomaly fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Multiply by `anomaly_multiplier`
    #[default]
    Spike,
    /// Collapse to zero
    Drop,
    /// Pin to the parameter minimum (or 0)
    Min,
    /// Pin to the parameter maximum (or twice the value)
    Max,
}

/// Fault injection settings for one parameter. Absent fields disable their stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    /// Probability of dropping the value entirely
    pub mcar_probability: Option<f64>,
    /// Drift added per sample
    pub drift_rate: Option<f64>,
    /// Seconds after which accumulated drift resets
    pub drift_reset_interval: Option<f64>,
    /// Probability of an anomaly per sample
    pub anomaly_probability: Option<f64>,
    pub anomaly_multiplier: Option<f64>,
    pub anomaly_type: Option<AnomalyKind>,
    /// Standard deviation of additive Gaussian noise
    pub noise_std_dev: Option<f64>,
}

impl ErrorConfig {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Single parameter of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: ValueKind,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, alias = "min")]
    pub min_value: Option<f64>,
    #[serde(default, alias = "max")]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub generation_mode: GenerationMode,
    /// Static generation parameters. Running state is seeded from a copy of this map.
    #[serde(default)]
    pub generation_params: Map<String, Value>,
    #[serde(default)]
    pub error_config: ErrorConfig,
    /// Tag parameters are per-device metadata, never time-series columns
    #[serde(default)]
    pub is_tag: bool,
}

impl ParameterDefinition {
    pub fn new(id: &str, kind: ValueKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            unit: None,
            min_value: None,
            max_value: None,
            default_value: None,
            generation_mode: GenerationMode::Random,
            generation_params: Map::new(),
            error_config: ErrorConfig::default(),
            is_tag: false,
        }
    }

    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    pub fn with_mode(mut self, mode: GenerationMode) -> Self {
        self.generation_mode = mode;
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.generation_params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_errors(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn as_tag(mut self) -> Self {
        self.is_tag = true;
        self
    }

    /// Both bounds, when both are configured
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        }
    }

    /// Default value interpreted as a number
    pub fn numeric_default(&self) -> Option<f64> {
        match self.default_value.as_ref()? {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Starting point for stateful numeric modes: default, then min, then 0
    pub fn initial_numeric(&self) -> f64 {
        self.numeric_default().or(self.min_value).unwrap_or(0.0)
    }

    /// Label shown to humans; falls back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Kinematic settings. An all-empty config means physics is off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    pub mass: Option<f64>,
    pub acceleration: Option<f64>,
    pub max_velocity: Option<f64>,
    pub target_position: Option<f64>,
}

impl PhysicsConfig {
    pub fn is_configured(&self) -> bool {
        self.mass.is_some()
            || self.acceleration.is_some()
            || self.max_velocity.is_some()
            || self.target_position.is_some()
    }
}

/// Condition/action pair, e.g. `temp > 100` / `status = "alarm"`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicRule {
    pub condition: String,
    pub action: String,
}

impl LogicRule {
    pub fn new(condition: &str, action: &str) -> Self {
        Self {
            condition: condition.to_string(),
            action: action.to_string(),
        }
    }
}

/// Registry snapshot of a simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Category code; one time-series super table per category
    #[serde(rename = "type", alias = "category")]
    pub category: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub physics_config: PhysicsConfig,
    #[serde(default)]
    pub logic_rules: Vec<LogicRule>,
    #[serde(default)]
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(id: &str, category: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            category: category.to_string(),
            model: None,
            parameters: Vec::new(),
            physics_config: PhysicsConfig::default(),
            logic_rules: Vec::new(),
            status: DeviceStatus::Running,
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterDefinition) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_rule(mut self, condition: &str, action: &str) -> Self {
        self.logic_rules.push(LogicRule::new(condition, action));
        self
    }

    pub fn with_physics(mut self, physics: PhysicsConfig) -> Self {
        self.physics_config = physics;
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == DeviceStatus::Running
    }

    pub fn parameter(&self, id: &str) -> Option<&ParameterDefinition> {
        self.parameters.iter().find(|p| p.id == id)
    }

    /// Parameters persisted as time-series columns
    pub fn value_parameters(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.parameters.iter().filter(|p| !p.is_tag)
    }

    pub fn tag_parameters(&self) -> impl Iterator<Item = &ParameterDefinition> {
        self.parameters.iter().filter(|p| p.is_tag)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}
