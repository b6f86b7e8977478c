//! Message broker transport abstraction.
//!
//! The wire protocol (MQTT on the device) lives behind [`BrokerTransport`].
//! This module only defines the connect parameters, the will, and the shape
//! of inbound messages.

use serde_json::{json, Value};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker refused or did not answer the connect.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Operation requires an established session.
    #[error("Not connected")]
    NotConnected,

    /// The will is attached at connect time and cannot change mid-session.
    #[error("Will can only be changed while disconnected")]
    WillLocked,

    /// QoS level not supported by the session.
    #[error("Unsupported QoS level: {0}")]
    UnsupportedQos(u8),

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QoS {
    type Error = BrokerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(BrokerError::UnsupportedQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// Sentinel topic and payload meaning "no will".
pub const DISABLED_WILL: &str = "0";

/// Last-will registered with the broker at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
    pub clean_session: bool,
}

impl Default for Will {
    fn default() -> Self {
        Self {
            topic: DISABLED_WILL.to_string(),
            payload: DISABLED_WILL.to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            clean_session: true,
        }
    }
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Whether a will should be sent at all.
    pub fn is_enabled(&self) -> bool {
        !self.topic.is_empty() && self.topic != DISABLED_WILL
    }
}

/// Username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub passphrase: String,
}

impl Credentials {
    /// `None` when both parts are empty (anonymous connect).
    pub fn from_parts(user: &str, passphrase: &str) -> Option<Self> {
        if user.is_empty() && passphrase.is_empty() {
            None
        } else {
            Some(Self {
                user: user.to_string(),
                passphrase: passphrase.to_string(),
            })
        }
    }
}

/// Everything the transport needs to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub address: Ipv4Addr,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    /// `None` when the configured will is disabled.
    pub will: Option<Will>,
    pub clean_session: bool,
}

/// Topic subscription requested by the device hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Payload as JSON. Anything that does not parse is wrapped as
    /// `{"value": "<payload>"}`.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload)
            .unwrap_or_else(|_| json!({ "value": self.payload_str() }))
    }
}

/// Broker client.
///
/// Implementations wrap the actual protocol client. All methods are
/// synchronous; `poll` services the connection and returns what arrived.
pub trait BrokerTransport: Send {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Publish at QoS 0.
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Service the connection. Returns inbound messages, oldest first.
    fn poll(&mut self) -> Vec<InboundMessage>;

    fn disconnect(&mut self);
}

impl<T: BrokerTransport + ?Sized> BrokerTransport for Box<T> {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        (**self).connect(options)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError> {
        (**self).publish(topic, payload, retain)
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        (**self).subscribe(topic, qos)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        (**self).unsubscribe(topic)
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        (**self).poll()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_will_is_disabled() {
        let will = Will::default();
        assert!(!will.is_enabled());
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.clean_session);
        assert!(!will.retain);

        assert!(Will::new("device/lwt", "offline").is_enabled());
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert!(matches!(QoS::try_from(2), Err(BrokerError::UnsupportedQos(2))));
        assert_eq!(u8::from(QoS::AtLeastOnce), 1);
    }

    #[test]
    fn test_credentials_anonymous() {
        assert_eq!(Credentials::from_parts("", ""), None);
        assert!(Credentials::from_parts("user", "").is_some());
    }

    #[test]
    fn test_inbound_json_wraps_plain_text() {
        let msg = InboundMessage::new("cmd", "ON");
        assert_eq!(msg.json(), json!({ "value": "ON" }));

        let msg = InboundMessage::new("cmd", r#"{"state":"OFF","brightness":10}"#);
        assert_eq!(msg.json()["brightness"], 10);
    }
}
