// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Object/variable node tree, one object per device

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{Device, GeneratedSample, SampleValue, ValueKind};

const NAMESPACE_INDEX: u16 = 1;

pub fn object_node_id(device_id: &str) -> String {
    format!("ns={};s={}", NAMESPACE_INDEX, device_id)
}

pub fn variable_node_id(device_id: &str, parameter_id: &str) -> String {
    format!("ns={};s={}.{}", NAMESPACE_INDEX, device_id, parameter_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableNode {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    pub kind: ValueKind,
    pub unit: Option<String>,
    pub value: SampleValue,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectNode {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    /// Keyed by parameter id
    pub variables: BTreeMap<String, VariableNode>,
}

/// Value change notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub node_id: String,
    pub value: SampleValue,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub id: String,
    pub name: String,
    pub kind: ValueKind,
    pub unit: Option<String>,
}

/// Everything the runtime needs to apply one sample, detached from the poller
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub device_id: String,
    pub display_name: String,
    pub variables: Vec<VariableSpec>,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, SampleValue>,
}

impl NodeUpdate {
    pub fn from_sample(device: &Device, sample: &GeneratedSample) -> Self {
        Self {
            device_id: device.id.clone(),
            display_name: device.display_name().to_string(),
            variables: device
                .parameters
                .iter()
                .map(|p| VariableSpec {
                    id: p.id.clone(),
                    name: p.display_name().to_string(),
                    kind: p.kind,
                    unit: p.unit.clone(),
                })
                .collect(),
            timestamp: sample.timestamp,
            values: sample.data.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("node {0} is not writable")]
    NotWritable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BrowseSnapshot {
    pub namespace_uri: String,
    pub objects: Vec<ObjectNode>,
}

#[derive(Debug, Clone)]
pub struct AddressSpace {
    namespace_uri: String,
    /// Keyed by device id
    objects: BTreeMap<String, ObjectNode>,
}

impl AddressSpace {
    pub fn new(namespace_uri: &str) -> Self {
        Self {
            namespace_uri: namespace_uri.to_string(),
            objects: BTreeMap::new(),
        }
    }

    /// Create missing nodes, then set every supplied value
    pub fn apply(&mut self, update: NodeUpdate) -> Vec<Change> {
        let device_id = update.device_id;
        let object = self.objects.entry(device_id.clone()).or_insert_with(|| ObjectNode {
            node_id: object_node_id(&device_id),
            browse_name: device_id.clone(),
            display_name: update.display_name.clone(),
            variables: BTreeMap::new(),
        });
        object.display_name = update.display_name;

        let mut changes = Vec::new();
        for spec in update.variables {
            let variable = object.variables.entry(spec.id.clone()).or_insert_with(|| VariableNode {
                node_id: variable_node_id(&device_id, &spec.id),
                browse_name: spec.id.clone(),
                display_name: spec.name.clone(),
                kind: spec.kind,
                unit: spec.unit.clone(),
                value: SampleValue::Null,
                source_timestamp: None,
                writable: true,
            });
            variable.kind = spec.kind;

            if let Some(value) = update.values.get(&spec.id) {
                variable.value = value.clone();
                variable.source_timestamp = Some(update.timestamp);
                changes.push(Change {
                    node_id: variable.node_id.clone(),
                    value: value.clone(),
                    timestamp: update.timestamp,
                });
            }
        }
        changes
    }

    /// Client write; the value is coerced to the variable's kind
    pub fn write(&mut self, node_id: &str, value: SampleValue) -> Result<Change, WriteError> {
        let variable = self
            .objects
            .values_mut()
            .flat_map(|o| o.variables.values_mut())
            .find(|v| v.node_id == node_id)
            .ok_or_else(|| WriteError::UnknownNode(node_id.to_string()))?;
        if !variable.writable {
            return Err(WriteError::NotWritable(node_id.to_string()));
        }

        let now = Utc::now();
        variable.value = value.coerce(variable.kind);
        variable.source_timestamp = Some(now);
        Ok(Change {
            node_id: node_id.to_string(),
            value: variable.value.clone(),
            timestamp: now,
        })
    }

    pub fn remove(&mut self, device_id: &str) -> bool {
        self.objects.remove(device_id).is_some()
    }

    pub fn object(&self, device_id: &str) -> Option<&ObjectNode> {
        self.objects.get(device_id)
    }

    pub fn value(&self, device_id: &str, parameter_id: &str) -> Option<&SampleValue> {
        self.objects.get(device_id)?.variables.get(parameter_id).map(|v| &v.value)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn browse(&self) -> BrowseSnapshot {
        BrowseSnapshot {
            namespace_uri: self.namespace_uri.clone(),
            objects: self.objects.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParameterDefinition;

    fn update(temp: f64) -> NodeUpdate {
        let device = Device::new("kiln", "kiln")
            .with_parameter(ParameterDefinition::new("temp", ValueKind::Number))
            .with_parameter(ParameterDefinition::new("door", ValueKind::Boolean));
        let mut data = BTreeMap::new();
        data.insert("temp".to_string(), SampleValue::Number(temp));
        let sample = GeneratedSample { device_id: "kiln".into(), timestamp: Utc::now(), data };
        NodeUpdate::from_sample(&device, &sample)
    }

    #[test]
    fn test_nodes_created_lazily() {
        let mut space = AddressSpace::new("urn:test");
        assert!(space.is_empty());

        let changes = space.apply(update(800.0));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].node_id, "ns=1;s=kiln.temp");

        let object = space.object("kiln").unwrap();
        assert_eq!(object.node_id, "ns=1;s=kiln");
        assert_eq!(object.variables.len(), 2);
        assert_eq!(space.value("kiln", "door"), Some(&SampleValue::Null));

        space.apply(update(810.0));
        assert_eq!(space.len(), 1);
        assert_eq!(space.value("kiln", "temp"), Some(&SampleValue::Number(810.0)));
    }

    #[test]
    fn test_client_write() {
        let mut space = AddressSpace::new("urn:test");
        space.apply(update(800.0));

        let change = space.write("ns=1;s=kiln.door", SampleValue::Number(1.0)).unwrap();
        assert_eq!(change.value, SampleValue::Bool(true));
        assert_eq!(space.value("kiln", "door"), Some(&SampleValue::Bool(true)));

        assert_eq!(
            space.write("ns=1;s=kiln.nope", SampleValue::Null),
            Err(WriteError::UnknownNode("ns=1;s=kiln.nope".into()))
        );
    }

    #[test]
    fn test_remove_and_browse() {
        let mut space = AddressSpace::new("urn:test");
        space.apply(update(1.0));
        let snapshot = serde_json::to_value(space.browse()).unwrap();
        assert_eq!(snapshot["namespace_uri"], "urn:test");
        assert_eq!(snapshot["objects"][0]["variables"]["temp"]["value"], 1.0);

        assert!(space.remove("kiln"));
        assert!(space.browse().objects.is_empty());
    }
}
