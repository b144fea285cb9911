// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Per-device simulation state

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::faults::ErrorContext;
use super::physics::PhysicsState;
use super::strategies::GenerationState;

/// Everything the generator mutates for one device
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Keyed by parameter id
    pub parameter_states: HashMap<String, GenerationState>,
    pub physics_state: PhysicsState,
    /// Keyed by parameter id
    pub error_context: HashMap<String, ErrorContext>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub ticks: u64,
}

/// Lazily populated device id -> state map.
///
/// Each device's state sits behind its own mutex so a status reader only
/// contends with the generator for the device it is looking at.
#[derive(Default)]
pub struct DeviceStateStore {
    states: RwLock<HashMap<String, Arc<Mutex<DeviceState>>>>,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, device_id: &str) -> Arc<Mutex<DeviceState>> {
        if let Some(state) = self.states.read().get(device_id) {
            return state.clone();
        }
        self.states
            .write()
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Mutex<DeviceState>>> {
        self.states.read().get(device_id).cloned()
    }

    /// Copy of a device's state for diagnostics
    pub fn snapshot(&self, device_id: &str) -> Option<DeviceState> {
        self.get(device_id).map(|state| state.lock().clone())
    }

    /// Drop a device's state. Returns whether anything was removed.
    pub fn clear(&self, device_id: &str) -> bool {
        self.states.write().remove(device_id).is_some()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_lazy_create_and_clear() {
        let store = DeviceStateStore::new();
        assert!(store.get("a").is_none());

        store.get_or_create("a").lock().ticks = 3;
        assert_eq!(store.get_or_create("a").lock().ticks, 3);
        assert_eq!(store.len(), 1);

        assert!(store.clear("a"));
        assert!(!store.clear("a"));
        assert_eq!(store.get_or_create("a").lock().ticks, 0);
    }

    #[test]
    fn test_concurrent_access() {
        let store = Arc::new(DeviceStateStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.get_or_create("shared").lock().ticks += 1;
                        store.get_or_create(&format!("own-{}", i));
                        let _ = store.snapshot("shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.snapshot("shared").unwrap().ticks, 800);
        assert_eq!(store.device_ids().len(), 9);
    }
}
