// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Node-graph sink
//!
//! Devices appear as object nodes with one writable variable per parameter.
//! The address space is owned by a single-threaded tokio runtime on its own
//! thread; the poller hands it updates over a bounded queue and never waits.
//! An optional WebSocket endpoint lets clients browse, subscribe to changes
//! and write variables.

pub mod address_space;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use super::{Sink, SinkError, SinkKind, SinkStatus};
use crate::config::{NodeGraphSettings, SinkSettings};
use crate::model::{Device, GeneratedSample};
pub use address_space::{AddressSpace, BrowseSnapshot, Change, NodeUpdate};

const CHANGE_BUFFER: usize = 1024;

#[derive(Debug)]
enum Command {
    Update(NodeUpdate),
    Remove(String),
}

pub struct NodeGraphServer {
    sender: Option<mpsc::Sender<Command>>,
    space: Arc<RwLock<AddressSpace>>,
    local_addr: Option<SocketAddr>,
    thread: Option<JoinHandle<()>>,
}

impl NodeGraphServer {
    pub fn start(settings: &NodeGraphSettings) -> Result<Self> {
        let std_listener = match &settings.listen {
            Some(listen) => {
                let listener = std::net::TcpListener::bind(listen)
                    .with_context(|| format!("binding node-graph listener on {}", listen))?;
                listener.set_nonblocking(true)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = match &std_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let (sender, mut receiver) = mpsc::channel::<Command>(settings.queue_capacity);
        let space = Arc::new(RwLock::new(AddressSpace::new(&settings.namespace_uri)));
        let shared = space.clone();

        let thread = thread::Builder::new()
            .name("fleetsim-nodegraph".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let (changes, _) = broadcast::channel::<Change>(CHANGE_BUFFER);

                    if let Some(listener) = std_listener {
                        match tokio::net::TcpListener::from_std(listener) {
                            Ok(listener) => {
                                tokio::spawn(session::serve(listener, shared.clone(), changes.clone()));
                            }
                            Err(e) => error!("Node-graph listener setup failed: {}", e),
                        }
                    }

                    while let Some(command) = receiver.recv().await {
                        match command {
                            Command::Update(update) => {
                                let applied = shared.write().apply(update);
                                for change in applied {
                                    // No subscribers is not an error
                                    let _ = changes.send(change);
                                }
                            }
                            Command::Remove(device_id) => {
                                if shared.write().remove(&device_id) {
                                    debug!("Removed node-graph object for {}", device_id);
                                }
                            }
                        }
                    }
                    debug!("Node-graph queue closed");
                });
            })?;

        info!("Node-graph address space {} started", settings.namespace_uri);
        Ok(Self {
            sender: Some(sender),
            space,
            local_addr,
            thread: Some(thread),
        })
    }

    fn submit(&self, command: Command) -> Result<(), SinkError> {
        let sender = self.sender.as_ref().ok_or(SinkError::NotConnected)?;
        sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Capacity("node-graph update queue full".to_string()),
            mpsc::error::TrySendError::Closed(_) => SinkError::NotConnected,
        })
    }

    pub fn address_space(&self) -> Arc<RwLock<AddressSpace>> {
        self.space.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Close the queue and wait for the runtime to drain it
    pub fn stop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for NodeGraphServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct NodeGraphSink {
    settings: Option<NodeGraphSettings>,
    server: Option<NodeGraphServer>,
    status: SinkStatus,
}

impl Default for NodeGraphSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeGraphSink {
    pub fn new() -> Self {
        Self {
            settings: None,
            server: None,
            status: SinkStatus::Disabled,
        }
    }

    pub fn address_space(&self) -> Option<Arc<RwLock<AddressSpace>>> {
        self.server.as_ref().map(NodeGraphServer::address_space)
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(NodeGraphServer::local_addr)
    }

    fn stop_server(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
    }
}

impl Sink for NodeGraphSink {
    fn kind(&self) -> SinkKind {
        SinkKind::NodeGraph
    }

    fn configure(&mut self, settings: &SinkSettings) -> SinkStatus {
        let settings = &settings.nodegraph;

        if !settings.enabled {
            self.stop_server();
            self.settings = None;
            self.status = SinkStatus::Disabled;
            return self.status();
        }
        if let Some(field) = settings.missing_field() {
            self.stop_server();
            self.settings = None;
            self.status = SinkStatus::Misconfigured(format!("missing {}", field));
            return self.status();
        }

        if self.settings.as_ref() != Some(settings) {
            self.stop_server();
            self.settings = Some(settings.clone());
        }
        if self.server.is_none() {
            self.status = match NodeGraphServer::start(settings) {
                Ok(server) => {
                    self.server = Some(server);
                    SinkStatus::Connected
                }
                Err(e) => SinkStatus::Degraded(format!("{:#}", e)),
            };
        }
        self.status()
    }

    fn dispatch(&mut self, device: &Device, sample: &GeneratedSample) -> Result<(), SinkError> {
        let server = self.server.as_ref().ok_or(SinkError::NotConnected)?;
        server.submit(Command::Update(NodeUpdate::from_sample(device, sample)))
    }

    /// Variables hold the latest value only
    fn dispatch_batch(&mut self, device: &Device, samples: &[GeneratedSample]) -> Result<(), SinkError> {
        match samples.last() {
            Some(sample) => self.dispatch(device, sample),
            None => Ok(()),
        }
    }

    fn status(&self) -> SinkStatus {
        self.status.clone()
    }

    fn forget(&mut self, device_id: &str) {
        if let Some(server) = &self.server {
            if let Err(e) = server.submit(Command::Remove(device_id.to_string())) {
                debug!("Could not queue node removal for {}: {}", device_id, e);
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop_server();
        self.settings = None;
        self.status = SinkStatus::Disabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParameterDefinition, SampleValue, ValueKind};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    fn enabled() -> SinkSettings {
        let mut settings = SinkSettings::default();
        settings.nodegraph.enabled = true;
        settings
    }

    fn device() -> Device {
        Device::new("press-1", "press").with_parameter(ParameterDefinition::new("force", ValueKind::Number))
    }

    fn sample(force: f64) -> GeneratedSample {
        let mut data = BTreeMap::new();
        data.insert("force".to_string(), SampleValue::Number(force));
        GeneratedSample { device_id: "press-1".into(), timestamp: Utc::now(), data }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_updates_reach_address_space() {
        let mut sink = NodeGraphSink::new();
        assert_eq!(sink.configure(&enabled()), SinkStatus::Connected);
        let space = sink.address_space().unwrap();

        sink.dispatch(&device(), &sample(42.0)).unwrap();
        assert!(wait_for(|| space.read().value("press-1", "force") == Some(&SampleValue::Number(42.0))));

        sink.forget("press-1");
        assert!(wait_for(|| space.read().is_empty()));
        sink.shutdown();
    }

    #[test]
    fn test_dispatch_without_server() {
        let mut sink = NodeGraphSink::new();
        assert!(matches!(sink.dispatch(&device(), &sample(1.0)), Err(SinkError::NotConnected)));
    }

    #[test]
    fn test_stop_drains_queue() {
        let mut settings = NodeGraphSettings::default();
        settings.enabled = true;
        let mut server = NodeGraphServer::start(&settings).unwrap();
        for i in 0..10 {
            server
                .submit(Command::Update(NodeUpdate::from_sample(&device(), &sample(i as f64))))
                .unwrap();
        }
        let space = server.address_space();
        server.stop();

        assert_eq!(space.read().value("press-1", "force"), Some(&SampleValue::Number(9.0)));
        assert!(matches!(
            server.submit(Command::Remove("press-1".into())),
            Err(SinkError::NotConnected)
        ));
    }
}
