//! Device registry adapters
//!
//! The engine only reads device snapshots. Registries that can observe
//! removals queue the removed ids for the scheduler to drain.

mod sqlite;

pub use sqlite::SqliteRegistry;

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{RegistryConfig, RegistryKind};
use crate::model::Device;

pub trait DeviceRegistry: Send + Sync {
    /// Snapshot of every device whose status is running, in a stable order
    fn list_running_devices(&self) -> Result<Vec<Device>>;

    /// Ids removed since the last call
    fn take_deleted(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Open the registry named by the configuration
pub fn open(config: &RegistryConfig) -> Result<Box<dyn DeviceRegistry>> {
    let registry: Box<dyn DeviceRegistry> = match config.kind {
        RegistryKind::File => Box::new(FileRegistry::new(&config.path)),
        RegistryKind::Sqlite => Box::new(SqliteRegistry::open(&config.path)?),
    };
    info!("Device registry: {:?} at {}", config.kind, config.path.display());
    Ok(registry)
}

/// Tracks the ids seen on the previous read and queues those that vanished
#[derive(Debug, Default)]
pub(crate) struct DeletionTracker {
    known: Option<HashSet<String>>,
    pending: BTreeSet<String>,
}

impl DeletionTracker {
    pub(crate) fn observe<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        let current: HashSet<String> = ids.into_iter().map(str::to_string).collect();
        if let Some(known) = &self.known {
            for gone in known.difference(&current) {
                debug!("Device {} disappeared from registry", gone);
                self.pending.insert(gone.clone());
            }
        }
        for id in &current {
            self.pending.remove(id);
        }
        self.known = Some(current);
    }

    pub(crate) fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

/// Registry held in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    devices: RwLock<Vec<Device>>,
    deleted: Mutex<BTreeSet<String>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: RwLock::new(devices),
            deleted: Mutex::new(BTreeSet::new()),
        }
    }

    /// Insert or replace by id, keeping the original position
    pub fn upsert(&self, device: Device) {
        let mut devices = self.devices.write();
        self.deleted.lock().remove(&device.id);
        match devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device,
            None => devices.push(device),
        }
    }

    pub fn remove(&self, device_id: &str) -> Option<Device> {
        let mut devices = self.devices.write();
        let index = devices.iter().position(|d| d.id == device_id)?;
        self.deleted.lock().insert(device_id.to_string());
        Some(devices.remove(index))
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl DeviceRegistry for InMemoryRegistry {
    fn list_running_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.read().iter().filter(|d| d.is_running()).cloned().collect())
    }

    fn take_deleted(&self) -> Vec<String> {
        std::mem::take(&mut *self.deleted.lock()).into_iter().collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FleetFile {
    List(Vec<Device>),
    Wrapped { devices: Vec<Device> },
}

/// Fleet described by a JSON file, re-read on every refresh.
/// Accepts either a bare array of devices or `{"devices": [...]}`.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    tracker: Mutex<DeletionTracker>,
}

impl FileRegistry {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            tracker: Mutex::new(DeletionTracker::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<Device>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading fleet file {}", self.path.display()))?;
        let fleet: FleetFile = serde_json::from_str(&content)
            .with_context(|| format!("parsing fleet file {}", self.path.display()))?;
        let devices = match fleet {
            FleetFile::List(devices) | FleetFile::Wrapped { devices } => devices,
        };

        let mut seen = HashSet::new();
        for device in &devices {
            if !seen.insert(device.id.as_str()) {
                anyhow::bail!("duplicate device id {} in {}", device.id, self.path.display());
            }
        }
        Ok(devices)
    }
}

impl DeviceRegistry for FileRegistry {
    fn list_running_devices(&self) -> Result<Vec<Device>> {
        let devices = self.read_all()?;
        self.tracker.lock().observe(devices.iter().map(|d| d.id.as_str()));
        Ok(devices.into_iter().filter(Device::is_running).collect())
    }

    fn take_deleted(&self) -> Vec<String> {
        self.tracker.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceStatus;

    #[test]
    fn test_in_memory_filters_and_queues_deletions() {
        let registry = InMemoryRegistry::with_devices(vec![
            Device::new("a", "pump"),
            Device::new("b", "pump").with_status(DeviceStatus::Stopped),
        ]);

        let running = registry.list_running_devices().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a");

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.take_deleted(), vec!["a".to_string()]);
        assert!(registry.take_deleted().is_empty());

        registry.upsert(Device::new("b", "pump"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list_running_devices().unwrap()[0].id, "b");
    }

    #[test]
    fn test_file_registry_detects_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(
            &path,
            r#"{"devices": [
                {"id": "p1", "type": "pump", "status": "running"},
                {"id": "p2", "type": "pump", "status": "stopped"}
            ]}"#,
        )
        .unwrap();

        let registry = FileRegistry::new(&path);
        let running = registry.list_running_devices().unwrap();
        assert_eq!(running.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["p1"]);
        assert!(registry.take_deleted().is_empty());

        std::fs::write(&path, r#"[{"id": "p1", "type": "pump", "status": "RUNNING"}]"#).unwrap();
        registry.list_running_devices().unwrap();
        assert_eq!(registry.take_deleted(), vec!["p2".to_string()]);
    }

    #[test]
    fn test_file_registry_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(&dir.path().join("missing.json"));
        assert!(registry.list_running_devices().is_err());

        let path = dir.path().join("dup.json");
        std::fs::write(&path, r#"[{"id": "x", "type": "t"}, {"id": "x", "type": "t"}]"#).unwrap();
        let err = FileRegistry::new(&path).list_running_devices().unwrap_err();
        assert!(err.to_string().contains("duplicate device id x"));
    }
}
