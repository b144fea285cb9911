// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Fieldbus sink: one contiguous register block per device

pub mod modbus;
pub mod registers;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Sink, SinkError, SinkKind, SinkStatus};
use crate::config::{FieldbusSettings, SinkSettings};
use crate::model::{Device, GeneratedSample};
pub use modbus::ModbusServer;
pub use registers::{encode_register, RegisterBank, RegisterMap};

pub struct FieldbusSink {
    settings: Option<FieldbusSettings>,
    bank: Arc<RegisterBank>,
    map: Arc<RegisterMap>,
    server: Option<ModbusServer>,
    listener_error: Option<String>,
    status: SinkStatus,
}

impl Default for FieldbusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldbusSink {
    pub fn new() -> Self {
        let defaults = FieldbusSettings::default();
        Self {
            settings: None,
            bank: Arc::new(RegisterBank::new(defaults.register_count)),
            map: Arc::new(Self::map_for(&defaults)),
            server: None,
            listener_error: None,
            status: SinkStatus::Disabled,
        }
    }

    fn layout_of(settings: &FieldbusSettings) -> (usize, usize, usize) {
        (settings.base_offset as usize, settings.block_size as usize, settings.register_count)
    }

    fn map_for(settings: &FieldbusSettings) -> RegisterMap {
        RegisterMap::new(
            settings.base_offset as usize,
            settings.block_size as usize,
            settings.register_count,
        )
    }

    pub fn bank(&self) -> Arc<RegisterBank> {
        self.bank.clone()
    }

    pub fn register_map(&self) -> Arc<RegisterMap> {
        self.map.clone()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(ModbusServer::local_addr)
    }

    fn stop_server(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
    }

    fn start_server(&mut self) {
        let Some(settings) = &self.settings else { return };
        let Some(listen) = settings.listen.clone() else {
            self.listener_error = None;
            return;
        };

        match ModbusServer::start(self.bank.clone(), &listen, settings.unit_id) {
            Ok(server) => {
                self.server = Some(server);
                self.listener_error = None;
            }
            Err(e) => {
                debug!("Modbus listener on {} unavailable: {:#}", listen, e);
                self.listener_error = Some(format!("{:#}", e));
            }
        }
    }

    /// Only called while the map is empty or the layout is unchanged
    fn apply(&mut self, settings: &FieldbusSettings) {
        let previous = self.settings.replace(settings.clone());

        let layout_changed = self.map.layout() != Self::layout_of(settings);
        if layout_changed {
            self.bank = Arc::new(RegisterBank::new(settings.register_count));
            self.map = Arc::new(Self::map_for(settings));
        }

        let listener_changed = previous
            .map(|p| p.listen != settings.listen || p.unit_id != settings.unit_id)
            .unwrap_or(true);
        if layout_changed || listener_changed {
            self.stop_server();
            self.start_server();
        }
        info!(
            "Fieldbus registers: base {} block {} capacity {}",
            settings.base_offset, settings.block_size, settings.register_count
        );
    }
}

impl Sink for FieldbusSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Fieldbus
    }

    fn configure(&mut self, settings: &SinkSettings) -> SinkStatus {
        let settings = &settings.fieldbus;

        if !settings.enabled {
            self.stop_server();
            self.settings = None;
            self.status = SinkStatus::Disabled;
            return self.status();
        }
        if let Some(field) = settings.missing_field() {
            self.stop_server();
            self.settings = None;
            self.status = SinkStatus::Misconfigured(format!("invalid {}", field));
            return self.status();
        }

        // Device blocks are assigned for the life of the process
        if !self.map.is_empty() && self.map.layout() != Self::layout_of(settings) {
            if self.status.accepts_samples() {
                warn!(
                    "Register layout change ignored; {} device block(s) are already mapped",
                    self.map.len()
                );
            }
            self.status = SinkStatus::Misconfigured(
                "register layout is fixed once devices are mapped; restart to change it".to_string(),
            );
            return self.status();
        }

        if self.settings.as_ref() != Some(settings) {
            self.apply(settings);
        } else if self.server.is_none() && settings.listen.is_some() {
            self.start_server();
        }

        self.status = match &self.listener_error {
            Some(reason) => SinkStatus::Degraded(reason.clone()),
            None => SinkStatus::Connected,
        };
        self.status()
    }

    /// Registers are written in parameter definition order from the block start.
    /// Strings and dropped values leave their register untouched.
    fn dispatch(&mut self, device: &Device, sample: &GeneratedSample) -> Result<(), SinkError> {
        let offset = self.map.allocate(&device.id)?;
        let block = self.map.block_size();

        for (index, parameter) in device.parameters.iter().enumerate() {
            if index >= block {
                debug!("Device {} has more parameters than its {}-register block", device.id, block);
                break;
            }
            if let Some(word) = sample.get(&parameter.id).and_then(encode_register) {
                if !self.bank.write(offset + index, &[word]) {
                    return Err(SinkError::Capacity(format!("register {} out of range", offset + index)));
                }
            }
        }
        Ok(())
    }

    /// Registers are last-write-wins, so only the newest sample matters
    fn dispatch_batch(&mut self, device: &Device, samples: &[GeneratedSample]) -> Result<(), SinkError> {
        match samples.last() {
            Some(sample) => self.dispatch(device, sample),
            None => Ok(()),
        }
    }

    fn status(&self) -> SinkStatus {
        self.status.clone()
    }

    fn shutdown(&mut self) {
        self.stop_server();
        self.settings = None;
        self.status = SinkStatus::Disabled;
    }
}
