// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! MQTT publisher for generated samples

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use tracing::{debug, info, warn};

use super::{Sink, SinkError, SinkKind, SinkStatus};
use crate::config::{PubSubSettings, SinkSettings};
use crate::model::{Device, GeneratedSample};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 256;
/// Total time one backfill batch may wait on a full request queue
const BATCH_DEADLINE: Duration = Duration::from_secs(2);
const BATCH_BACKOFF: Duration = Duration::from_millis(20);

/// Serialized message body: `{device_id, timestamp, data}`
pub fn encode_payload(sample: &GeneratedSample) -> Result<Vec<u8>, SinkError> {
    Ok(serde_json::to_vec(sample)?)
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Live broker session; the event loop runs on its own thread
struct Session {
    client: Client,
    link: Arc<LinkState>,
    _stop: Sender<()>,
}

impl Session {
    fn open(settings: &PubSubSettings) -> Result<Self, SinkError> {
        let client_id = format!("{}-{}", settings.client_id, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let link = Arc::new(LinkState::default());
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let broker = format!("{}:{}", settings.host, settings.port);

        let thread_link = link.clone();
        thread::Builder::new()
            .name("fleetsim-mqtt".to_string())
            .spawn(move || drive(connection, thread_link, stop_rx, broker))
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            link,
            _stop: stop_tx,
        })
    }
}

/// Pump the connection; rumqttc reconnects on the next poll after an error
fn drive(mut connection: Connection, link: Arc<LinkState>, stop: channel::Receiver<()>, broker: String) {
    for event in connection.iter() {
        match stop.try_recv() {
            Err(channel::TryRecvError::Empty) => {}
            _ => break,
        }

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                link.connected.store(true, Ordering::SeqCst);
                *link.last_error.lock() = None;
                info!("MQTT connected to {}", broker);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                link.connected.store(false, Ordering::SeqCst);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                link.connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                if link.connected.swap(false, Ordering::SeqCst) {
                    warn!("MQTT connection to {} lost: {}", broker, e);
                }
                *link.last_error.lock() = Some(e.to_string());
                match stop.recv_timeout(RECONNECT_DELAY) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }
    }
    debug!("MQTT event loop for {} stopped", broker);
}

/// Repeat `attempt` while it reports a transport error, until `deadline`
fn retry_until<F>(deadline: Instant, mut attempt: F) -> Result<(), SinkError>
where
    F: FnMut() -> Result<(), SinkError>,
{
    loop {
        match attempt() {
            Err(SinkError::Transport(reason)) => {
                if Instant::now() + BATCH_BACKOFF > deadline {
                    return Err(SinkError::Capacity(reason));
                }
                thread::sleep(BATCH_BACKOFF);
            }
            result => return result,
        }
    }
}

pub struct PubSubSink {
    settings: Option<PubSubSettings>,
    session: Option<Session>,
    status: SinkStatus,
}

impl Default for PubSubSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubSink {
    pub fn new() -> Self {
        Self {
            settings: None,
            session: None,
            status: SinkStatus::Disabled,
        }
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.client.disconnect() {
                debug!("MQTT disconnect: {}", e);
            }
        }
    }
}

impl Sink for PubSubSink {
    fn kind(&self) -> SinkKind {
        SinkKind::PubSub
    }

    fn configure(&mut self, settings: &SinkSettings) -> SinkStatus {
        let settings = &settings.pubsub;

        if !settings.enabled {
            self.close();
            self.settings = None;
            self.status = SinkStatus::Disabled;
        } else if let Some(field) = settings.missing_field() {
            self.close();
            self.settings = None;
            self.status = SinkStatus::Misconfigured(format!("missing {}", field));
        } else if self.settings.as_ref() != Some(settings) {
            self.close();
            self.settings = Some(settings.clone());
            self.status = match Session::open(settings) {
                Ok(session) => {
                    info!("MQTT publishing to {}:{} as {}", settings.host, settings.port, settings.topic_template);
                    self.session = Some(session);
                    SinkStatus::Connecting
                }
                Err(e) => SinkStatus::Degraded(e.to_string()),
            };
        }

        self.status()
    }

    fn dispatch(&mut self, _device: &Device, sample: &GeneratedSample) -> Result<(), SinkError> {
        let (Some(settings), Some(session)) = (&self.settings, &mut self.session) else {
            return Err(SinkError::NotConnected);
        };
        if !session.link.connected.load(Ordering::SeqCst) {
            return Err(SinkError::NotConnected);
        }

        let topic = settings.topic_for(&sample.device_id);
        let payload = encode_payload(sample)?;
        session
            .client
            .try_publish(topic, qos(settings.qos), false, payload)
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    /// Backfill batches outrun the request queue; give the driver until the
    /// batch deadline to drain it, then drop the rest of the batch
    fn dispatch_batch(&mut self, device: &Device, samples: &[GeneratedSample]) -> Result<(), SinkError> {
        let deadline = Instant::now() + BATCH_DEADLINE;
        for (i, sample) in samples.iter().enumerate() {
            retry_until(deadline, || self.dispatch(device, sample)).map_err(|e| match e {
                SinkError::Capacity(reason) => SinkError::Capacity(format!(
                    "request queue still full after {:?}, dropped {} of {} sample(s): {}",
                    BATCH_DEADLINE,
                    samples.len() - i,
                    samples.len(),
                    reason
                )),
                other => other,
            })?;
        }
        Ok(())
    }

    fn status(&self) -> SinkStatus {
        match &self.session {
            Some(session) if session.link.connected.load(Ordering::SeqCst) => SinkStatus::Connected,
            Some(session) => match session.link.last_error.lock().as_ref() {
                Some(error) => SinkStatus::Degraded(error.clone()),
                None => SinkStatus::Connecting,
            },
            None => self.status.clone(),
        }
    }

    fn shutdown(&mut self) {
        self.close();
        self.settings = None;
        self.status = SinkStatus::Disabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleValue;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    #[test]
    fn test_payload_and_topic() {
        let mut data = BTreeMap::new();
        data.insert("rpm".to_string(), SampleValue::Number(1450.0));
        data.insert("site".to_string(), SampleValue::Text("north".into()));
        let sample = GeneratedSample {
            device_id: "pump-3".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            data,
        };

        let payload: serde_json::Value = serde_json::from_slice(&encode_payload(&sample).unwrap()).unwrap();
        assert_eq!(payload["device_id"], "pump-3");
        assert_eq!(payload["data"]["rpm"], 1450.0);
        assert_eq!(payload["data"]["site"], "north");

        let settings = PubSubSettings::default();
        assert_eq!(settings.topic_for("pump-3"), "devices/pump-3/data");
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(7), QoS::ExactlyOnce);
    }

    #[test]
    fn test_disabled_and_misconfigured() {
        let mut sink = PubSubSink::new();
        let mut settings = SinkSettings::default();
        assert_eq!(sink.configure(&settings), SinkStatus::Disabled);

        settings.pubsub.enabled = true;
        settings.pubsub.topic_template = " ".into();
        assert_eq!(sink.configure(&settings), SinkStatus::Misconfigured("missing topic_template".into()));
    }

    #[test]
    fn test_unreachable_broker_drops_samples() {
        let mut sink = PubSubSink::new();
        let mut settings = SinkSettings::default();
        settings.pubsub.enabled = true;
        settings.pubsub.host = "127.0.0.1".into();
        settings.pubsub.port = 1;

        let status = sink.configure(&settings);
        assert!(matches!(status, SinkStatus::Connecting | SinkStatus::Degraded(_)));

        let sample = GeneratedSample {
            device_id: "d".into(),
            timestamp: Utc::now(),
            data: BTreeMap::new(),
        };
        assert!(matches!(sink.dispatch(&Device::new("d", "c"), &sample), Err(SinkError::NotConnected)));

        sink.shutdown();
        assert_eq!(sink.status(), SinkStatus::Disabled);
    }

    #[test]
    fn test_batch_against_unreachable_broker_returns_promptly() {
        let mut sink = PubSubSink::new();
        let mut settings = SinkSettings::default();
        settings.pubsub.enabled = true;
        settings.pubsub.host = "127.0.0.1".into();
        settings.pubsub.port = 1;
        sink.configure(&settings);

        let samples: Vec<GeneratedSample> = (0..500)
            .map(|i| GeneratedSample {
                device_id: "d".into(),
                timestamp: Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(),
                data: BTreeMap::new(),
            })
            .collect();

        let started = Instant::now();
        assert!(sink.dispatch_batch(&Device::new("d", "c"), &samples).is_err());
        assert!(started.elapsed() < BATCH_DEADLINE);
        sink.shutdown();
    }

    #[test]
    fn test_full_queue_gives_up_at_the_deadline() {
        let started = Instant::now();
        let mut attempts = 0;
        let result = retry_until(started + Duration::from_millis(200), || {
            attempts += 1;
            Err(SinkError::Transport("request queue full".into()))
        });

        assert!(matches!(result, Err(SinkError::Capacity(_))));
        assert!(attempts > 1);
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut calls = 0;
        let result = retry_until(Instant::now() + Duration::from_secs(5), || {
            calls += 1;
            if calls < 3 {
                Err(SinkError::Transport("request queue full".into()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }
}
