// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Time-series sink: one super table per category, one sub-table per device

pub mod rest;
pub mod schema;

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{Sink, SinkError, SinkKind, SinkStatus};
use crate::config::{SinkSettings, TimeSeriesSettings};
use crate::model::{Device, GeneratedSample};
pub use rest::RestBackend;
pub use schema::{sub_table_name, sync_schema, SuperTable, SyncReport};

/// Rows per INSERT statement when writing batches
const MAX_ROWS_PER_INSERT: usize = 100;

/// SQL execution seam between the sink and the store
pub trait SqlBackend: Send {
    /// Run a write or DDL statement, returning affected rows
    fn execute(&mut self, sql: &str) -> Result<u64, SinkError>;

    /// Run a query, returning one map per row keyed by column name
    fn query(&mut self, sql: &str) -> Result<Vec<Map<String, Value>>, SinkError>;
}

pub type Connector = Box<dyn Fn(&TimeSeriesSettings) -> Result<Box<dyn SqlBackend>, SinkError> + Send>;

pub struct TimeSeriesSink {
    connector: Connector,
    settings: Option<TimeSeriesSettings>,
    backend: Option<Box<dyn SqlBackend>>,
    status: SinkStatus,
    /// Super table name -> layout signature last synced
    synced: HashMap<String, String>,
    /// Device id -> super table its sub-table was created under
    sub_tables: HashMap<String, String>,
    /// Sub-table name -> the device id that claimed it
    owners: HashMap<String, String>,
}

impl Default for TimeSeriesSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesSink {
    pub fn new() -> Self {
        Self::with_connector(Box::new(|settings: &TimeSeriesSettings| {
            RestBackend::connect(settings).map(|b| Box::new(b) as Box<dyn SqlBackend>)
        }))
    }

    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector,
            settings: None,
            backend: None,
            status: SinkStatus::Disabled,
            synced: HashMap::new(),
            sub_tables: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    fn disconnect(&mut self) {
        if self.backend.take().is_some() {
            info!("Time-series connection closed");
        }
        self.synced.clear();
        self.sub_tables.clear();
    }

    /// Connect lazily; a failure leaves the sink degraded until the next attempt
    fn connection(&mut self) -> Result<&mut dyn SqlBackend, SinkError> {
        if self.backend.is_none() {
            let settings = self.settings.as_ref().ok_or(SinkError::NotConnected)?;
            match (self.connector)(settings) {
                Ok(backend) => {
                    self.backend = Some(backend);
                    self.status = SinkStatus::Connected;
                }
                Err(e) => {
                    self.status = SinkStatus::Degraded(e.to_string());
                    return Err(e);
                }
            }
        }
        match self.backend.as_mut() {
            Some(backend) => Ok(&mut **backend),
            None => Err(SinkError::NotConnected),
        }
    }

    fn write(&mut self, device: &Device, samples: &[GeneratedSample]) -> Result<(), SinkError> {
        let table = SuperTable::for_device(device);
        let result = self.write_rows(device, &table, samples);

        if let Err(SinkError::Transport(reason)) = &result {
            warn!("Time-series transport failure, reconnecting next tick: {}", reason);
            self.backend = None;
            self.status = SinkStatus::Degraded(reason.clone());
        }
        result
    }

    /// Distinct ids can sanitize to the same sub-table; the first writer keeps it
    fn claim(&mut self, device_id: &str) -> Result<(), SinkError> {
        let name = sub_table_name(device_id);
        match self.owners.get(&name) {
            Some(owner) if owner != device_id => Err(SinkError::Conflict(format!(
                "device {} maps to sub-table {} already used by device {}",
                device_id, name, owner
            ))),
            Some(_) => Ok(()),
            None => {
                self.owners.insert(name, device_id.to_string());
                Ok(())
            }
        }
    }

    fn write_rows(&mut self, device: &Device, table: &SuperTable, samples: &[GeneratedSample]) -> Result<(), SinkError> {
        self.claim(&device.id)?;
        let signature = table.signature();
        if self.synced.get(&table.name) != Some(&signature) {
            let report = sync_schema(self.connection()?, table)?;
            debug!("Schema sync for {}: {:?}", table.name, report);
            self.synced.insert(table.name.clone(), signature);
        }

        if self.sub_tables.get(&device.id) != Some(&table.name) {
            let sql = table.create_sub_table_sql(device);
            self.connection()?.execute(&sql)?;
            self.sub_tables.insert(device.id.clone(), table.name.clone());
        }

        for chunk in samples.chunks(MAX_ROWS_PER_INSERT) {
            if let Some(sql) = table.insert_sql(device, chunk) {
                let rows = self.connection()?.execute(&sql)?;
                debug!("Inserted {} row(s) for {}", rows, device.id);
            }
        }
        Ok(())
    }
}

impl Sink for TimeSeriesSink {
    fn kind(&self) -> SinkKind {
        SinkKind::TimeSeries
    }

    fn configure(&mut self, settings: &SinkSettings) -> SinkStatus {
        let settings = &settings.timeseries;

        if !settings.enabled {
            self.disconnect();
            self.settings = None;
            self.status = SinkStatus::Disabled;
        } else if let Some(field) = settings.missing_field() {
            self.disconnect();
            self.settings = None;
            self.status = SinkStatus::Misconfigured(format!("missing {}", field));
        } else if self.settings.as_ref() != Some(settings) {
            self.disconnect();
            self.settings = Some(settings.clone());
            self.status = SinkStatus::Connecting;
        }

        self.status.clone()
    }

    fn dispatch(&mut self, device: &Device, sample: &GeneratedSample) -> Result<(), SinkError> {
        self.write(device, std::slice::from_ref(sample))
    }

    fn dispatch_batch(&mut self, device: &Device, samples: &[GeneratedSample]) -> Result<(), SinkError> {
        self.write(device, samples)
    }

    fn status(&self) -> SinkStatus {
        self.status.clone()
    }

    fn forget(&mut self, device_id: &str) {
        self.sub_tables.remove(device_id);
        self.owners.retain(|_, owner| owner != device_id);
    }

    fn shutdown(&mut self) {
        self.disconnect();
        self.settings = None;
        self.status = SinkStatus::Disabled;
    }
}
