//! Sinks - destinations every generated sample fans out to

pub mod fieldbus;
pub mod nodegraph;
pub mod pubsub;
pub mod timeseries;

pub use fieldbus::FieldbusSink;
pub use nodegraph::NodeGraphSink;
pub use pubsub::PubSubSink;
pub use timeseries::TimeSeriesSink;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::SinkSettings;
use crate::model::{Device, GeneratedSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    TimeSeries,
    PubSub,
    Fieldbus,
    NodeGraph,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkKind::TimeSeries => "timeseries",
            SinkKind::PubSub => "pubsub",
            SinkKind::Fieldbus => "fieldbus",
            SinkKind::NodeGraph => "nodegraph",
        };
        f.write_str(name)
    }
}

/// Operator-visible sink state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SinkStatus {
    Disabled,
    /// Enabled but a required setting is missing; stays idle until corrected
    Misconfigured(String),
    /// Enabled, connection not yet established
    Connecting,
    Connected,
    /// Enabled, last attempt failed; retried on the next tick
    Degraded(String),
}

impl SinkStatus {
    /// Whether samples should be handed to the sink
    pub fn accepts_samples(&self) -> bool {
        matches!(self, SinkStatus::Connecting | SinkStatus::Connected | SinkStatus::Degraded(_))
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink misconfigured: missing {0}")]
    Misconfigured(&'static str),
    #[error("sink not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected by server (code {code}): {desc}")]
    Rejected { code: i64, desc: String },
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("capacity exhausted: {0}")]
    Capacity(String),
    #[error("name conflict: {0}")]
    Conflict(String),
}

/// A destination for generated samples.
///
/// `configure` runs at the start of every tick with the latest settings and
/// must be cheap when nothing changed. Dispatch happens on the poller thread.
pub trait Sink: Send {
    fn kind(&self) -> SinkKind;

    fn configure(&mut self, settings: &SinkSettings) -> SinkStatus;

    fn dispatch(&mut self, device: &Device, sample: &GeneratedSample) -> Result<(), SinkError>;

    fn dispatch_batch(&mut self, device: &Device, samples: &[GeneratedSample]) -> Result<(), SinkError> {
        for sample in samples {
            self.dispatch(device, sample)?;
        }
        Ok(())
    }

    fn status(&self) -> SinkStatus;

    /// Release any per-device resources after the device was deleted
    fn forget(&mut self, _device_id: &str) {}

    fn shutdown(&mut self) {}
}

/// Snapshot of one sink for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SinkReport {
    pub kind: SinkKind,
    pub status: SinkStatus,
    pub delivered: u64,
    pub failed: u64,
}

struct Slot {
    sink: Box<dyn Sink>,
    status: SinkStatus,
    delivered: u64,
    failed: u64,
    /// Set when a call into the sink panicked, cleared by the next dispatch that returns
    panicked: Option<String>,
}

impl Slot {
    fn current_status(&self) -> SinkStatus {
        match &self.panicked {
            Some(reason) => SinkStatus::Degraded(reason.clone()),
            None => self.sink.status(),
        }
    }
}

/// Ordered collection of sinks with per-sink failure isolation
#[derive(Default)]
pub struct SinkSet {
    slots: Vec<Slot>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in sinks
    pub fn standard() -> Self {
        let mut set = Self::new();
        set.push(Box::new(TimeSeriesSink::new()));
        set.push(Box::new(PubSubSink::new()));
        set.push(Box::new(FieldbusSink::new()));
        set.push(Box::new(NodeGraphSink::new()));
        set
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        self.slots.push(Slot {
            sink,
            status: SinkStatus::Disabled,
            delivered: 0,
            failed: 0,
            panicked: None,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Apply the latest settings to every sink, logging state transitions
    pub fn reconcile(&mut self, settings: &SinkSettings) {
        for slot in &mut self.slots {
            let status = match panic::catch_unwind(AssertUnwindSafe(|| slot.sink.configure(settings))) {
                Ok(status) => match &slot.panicked {
                    Some(reason) if status.accepts_samples() => SinkStatus::Degraded(reason.clone()),
                    _ => status,
                },
                Err(payload) => {
                    let reason = panic_reason(payload.as_ref());
                    error!("Sink {} panicked while configuring: {}", slot.sink.kind(), reason);
                    slot.panicked = Some(reason.clone());
                    SinkStatus::Degraded(reason)
                }
            };
            if status != slot.status {
                match &status {
                    SinkStatus::Misconfigured(reason) | SinkStatus::Degraded(reason) => {
                        warn!("Sink {} is {}: {}", slot.sink.kind(), status_label(&status), reason)
                    }
                    _ => info!("Sink {} is now {}", slot.sink.kind(), status_label(&status)),
                }
                slot.status = status;
            }
        }
    }

    /// Hand a sample to every active sink. Returns how many sinks failed.
    pub fn dispatch(&mut self, device: &Device, sample: &GeneratedSample) -> usize {
        self.each_active(device, |sink| sink.dispatch(device, sample))
    }

    pub fn dispatch_batch(&mut self, device: &Device, samples: &[GeneratedSample]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        self.each_active(device, |sink| sink.dispatch_batch(device, samples))
    }

    fn each_active<F>(&mut self, device: &Device, mut f: F) -> usize
    where
        F: FnMut(&mut Box<dyn Sink>) -> Result<(), SinkError>,
    {
        let mut failures = 0;
        for slot in &mut self.slots {
            if !slot.status.accepts_samples() {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| f(&mut slot.sink))) {
                Ok(result) => {
                    slot.panicked = None;
                    match result {
                        Ok(()) => slot.delivered += 1,
                        Err(e) => {
                            failures += 1;
                            slot.failed += 1;
                            warn!("Sink {} failed for device {}: {}", slot.sink.kind(), device.id, e);
                        }
                    }
                }
                Err(payload) => {
                    failures += 1;
                    slot.failed += 1;
                    let reason = panic_reason(payload.as_ref());
                    error!("Sink {} panicked for device {}: {}", slot.sink.kind(), device.id, reason);
                    slot.panicked = Some(reason);
                }
            }
            slot.status = slot.current_status();
        }
        failures
    }

    pub fn forget(&mut self, device_id: &str) {
        for slot in &mut self.slots {
            slot.sink.forget(device_id);
        }
    }

    pub fn reports(&self) -> Vec<SinkReport> {
        self.slots
            .iter()
            .map(|slot| SinkReport {
                kind: slot.sink.kind(),
                status: slot.current_status(),
                delivered: slot.delivered,
                failed: slot.failed,
            })
            .collect()
    }

    pub fn statuses(&self) -> BTreeMap<SinkKind, SinkStatus> {
        self.slots.iter().map(|s| (s.sink.kind(), s.current_status())).collect()
    }

    pub fn shutdown(&mut self) {
        for slot in &mut self.slots {
            slot.sink.shutdown();
            slot.status = SinkStatus::Disabled;
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("sink panicked: {}", message)
}

fn status_label(status: &SinkStatus) -> &'static str {
    match status {
        SinkStatus::Disabled => "disabled",
        SinkStatus::Misconfigured(_) => "misconfigured",
        SinkStatus::Connecting => "connecting",
        SinkStatus::Connected => "connected",
        SinkStatus::Degraded(_) => "degraded",
    }
}
