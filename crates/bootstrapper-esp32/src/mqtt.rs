//! Broker transport on the ESP-IDF MQTT client.
//!
//! The IDF client connects in the background and reports through a
//! callback. `connect` creates a client and waits a bounded time for the
//! connected event; the session's retry loop handles the rest. Inbound
//! publishes are queued by the callback and drained by `poll`.

use bootstrapper_core::{BrokerError, BrokerTransport, ConnectOptions, InboundMessage, QoS};
use esp_idf_svc::mqtt::client::{
    EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration, QoS as EspQoS,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Longest wait for the connected event within one attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_POLL: Duration = Duration::from_millis(20);

/// Inbound queue bound; the oldest message goes first when full.
const INBOX_CAPACITY: usize = 32;

#[derive(Debug, Default)]
struct Shared {
    connected: bool,
    inbox: VecDeque<InboundMessage>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn esp_qos(qos: QoS) -> EspQoS {
    match qos {
        QoS::AtMostOnce => EspQoS::AtMostOnce,
        QoS::AtLeastOnce => EspQoS::AtLeastOnce,
    }
}

pub struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    shared: Arc<Mutex<Shared>>,
}

impl Default for EspMqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl EspMqttTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    fn open(&self, options: &ConnectOptions) -> Result<EspMqttClient<'static>, BrokerError> {
        let url = format!("mqtt://{}:{}", options.address, options.port);
        let lwt = options.will.as_ref().map(|will| LwtConfiguration {
            topic: will.topic.as_str(),
            payload: will.payload.as_bytes(),
            qos: esp_qos(will.qos),
            retain: will.retain,
        });
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            username: options.credentials.as_ref().map(|c| c.user.as_str()),
            password: options.credentials.as_ref().map(|c| c.passphrase.as_str()),
            lwt,
            disable_clean_session: !options.clean_session,
            ..Default::default()
        };

        let shared = self.shared.clone();
        EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => lock(&shared).connected = true,
            EventPayload::Disconnected => lock(&shared).connected = false,
            EventPayload::Received {
                topic: Some(topic),
                data,
                ..
            } => {
                let mut shared = lock(&shared);
                if shared.inbox.len() >= INBOX_CAPACITY {
                    shared.inbox.pop_front();
                }
                shared.inbox.push_back(InboundMessage::new(topic, data));
            }
            EventPayload::Error(e) => warn!("MQTT error: {:?}", e),
            _ => {}
        })
        .map_err(|e| BrokerError::ConnectFailed(e.to_string()))
    }
}

impl BrokerTransport for EspMqttTransport {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        self.disconnect();
        let client = self.open(options)?;

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while !lock(&self.shared).connected {
            if Instant::now() >= deadline {
                // Dropping the client stops its background reconnects
                drop(client);
                return Err(BrokerError::ConnectFailed("no CONNACK".to_string()));
            }
            thread::sleep(CONNECT_POLL);
        }
        info!("MQTT session open as {}", options.client_id);
        self.client = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && lock(&self.shared).connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, EspQoS::AtMostOnce, retain, payload)
            .map(|_| ())
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .subscribe(topic, esp_qos(qos))
            .map(|_| ())
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .unsubscribe(topic)
            .map(|_| ())
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        lock(&self.shared).inbox.drain(..).collect()
    }

    fn disconnect(&mut self) {
        if self.client.take().is_some() {
            debug!("MQTT client closed");
        }
        let mut shared = lock(&self.shared);
        shared.connected = false;
        shared.inbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert!(matches!(esp_qos(QoS::AtMostOnce), EspQoS::AtMostOnce));
        assert!(matches!(esp_qos(QoS::AtLeastOnce), EspQoS::AtLeastOnce));
    }

    #[test]
    fn test_requires_session() {
        let mut transport = EspMqttTransport::new();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("dev/state", b"{}", true),
            Err(BrokerError::NotConnected)
        ));
        assert!(transport.poll().is_empty());
    }
}
