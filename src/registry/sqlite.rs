// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Read-only adapter over the management application's `devices` table

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Row};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use super::{DeletionTracker, DeviceRegistry};
use crate::model::{Device, DeviceStatus};

const SELECT_DEVICES: &str = "SELECT id, name, type, model, parameters, physics_config, logic_rules, status \
                              FROM devices ORDER BY id";

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    tracker: Mutex<DeletionTracker>,
}

/// JSON column; NULL or empty text means the type's default
fn json_column<T: DeserializeOwned + Default>(row: &Row<'_>, index: usize, device_id: &str) -> T {
    let raw: Option<String> = row.get(index).unwrap_or(None);
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("null") => T::default(),
        Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
            warn!("Device {}: ignoring malformed JSON in column {}: {}", device_id, index, e);
            T::default()
        }),
    }
}

fn parse_status(raw: Option<String>, device_id: &str) -> DeviceStatus {
    let Some(raw) = raw else {
        return DeviceStatus::default();
    };
    serde_json::from_value(serde_json::Value::String(raw.clone())).unwrap_or_else(|_| {
        warn!("Device {}: unknown status {:?}", device_id, raw);
        DeviceStatus::Error
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let id: String = row.get(0)?;
    let name: Option<String> = row.get(1)?;
    let category: Option<String> = row.get(2)?;
    let model: Option<String> = row.get(3)?;
    let status: Option<String> = row.get(7)?;

    Ok(Device {
        name: name.unwrap_or_else(|| id.clone()),
        category: category.unwrap_or_default(),
        model,
        parameters: json_column(row, 4, &id),
        physics_config: json_column(row, 5, &id),
        logic_rules: json_column(row, 6, &id),
        status: parse_status(status, &id),
        id,
    })
}

impl SqliteRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_context(|| format!("opening device database {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(2))?;

        info!("Device database opened read-only at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            tracker: Mutex::new(DeletionTracker::default()),
        })
    }

    fn read_all(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SELECT_DEVICES).context("preparing device query")?;
        let rows = stmt.query_map([], device_from_row)?;

        let mut devices = Vec::new();
        for row in rows {
            match row {
                Ok(device) => devices.push(device),
                Err(e) => warn!("Skipping unreadable device row: {}", e),
            }
        }
        Ok(devices)
    }
}

impl DeviceRegistry for SqliteRegistry {
    fn list_running_devices(&self) -> Result<Vec<Device>> {
        let devices = self.read_all()?;
        self.tracker.lock().observe(devices.iter().map(|d| d.id.as_str()));
        Ok(devices.into_iter().filter(Device::is_running).collect())
    }

    fn take_deleted(&self) -> Vec<String> {
        self.tracker.lock().take()
    }
}
