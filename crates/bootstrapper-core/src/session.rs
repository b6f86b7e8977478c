//! Broker session management.
//!
//! [`BrokerSession`] owns the broker transport and keeps a session alive on
//! top of the link. Attempts are only made while the link is up. Failed
//! attempts share the retry rules of the link loop (see [`crate::retry`]).
//!
//! In blocking mode `connect` keeps trying until the session is up or the
//! link drops. In non-blocking mode every call makes at most one attempt.

use crate::broker::{
    BrokerError, BrokerTransport, ConnectOptions, Credentials, QoS, Subscription, Will,
};
use crate::config::BrokerConfig;
use crate::hooks::DeviceHooks;
use crate::link::LinkStatus;
use crate::platform::Clock;
use crate::retry::{Escalation, RetryCounter, RetryPolicy};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerSessionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    ShuttingDown,
}

/// Result of a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Not connected yet; the next tick tries again.
    RetryScheduled,
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Dropped,
}

/// Message broker session.
pub struct BrokerSession<T> {
    transport: T,
    broker: BrokerConfig,
    client_id: String,
    will: Will,
    policy: RetryPolicy,
    blocking: bool,
    counter: RetryCounter,
    state: BrokerSessionState,
    subscriptions: Vec<Subscription>,
    clock: Arc<dyn Clock>,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(
        transport: T,
        broker: BrokerConfig,
        client_id: impl Into<String>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            broker,
            client_id: client_id.into(),
            will: Will::default(),
            policy,
            blocking: true,
            counter: RetryCounter::new(),
            state: BrokerSessionState::Disconnected,
            subscriptions: Vec::new(),
            clock,
        }
    }

    /// Builder-style will.
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = will;
        self
    }

    /// Builder-style blocking mode (default: blocking).
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Establish the session if needed.
    ///
    /// Idempotent while connected: the subscription hook only runs on a
    /// fresh session.
    pub fn connect(&mut self, link: &dyn LinkStatus, hooks: &mut dyn DeviceHooks) -> ConnectOutcome {
        match self.state {
            BrokerSessionState::ShuttingDown => return ConnectOutcome::RetryScheduled,
            BrokerSessionState::Connected if self.transport.is_connected() => {
                return ConnectOutcome::Connected;
            }
            BrokerSessionState::Connected => {
                warn!(client_id = %self.client_id, "Broker session lost");
                self.state = BrokerSessionState::Disconnected;
            }
            _ => {}
        }

        loop {
            if !link.is_up() {
                debug!("Link down, broker connect deferred");
                return ConnectOutcome::RetryScheduled;
            }

            info!(
                broker = %self.broker.address,
                port = self.broker.port,
                client_id = %self.client_id,
                "Attempting MQTT connection"
            );
            match self.transport.connect(&self.connect_options()) {
                Ok(()) => {
                    self.on_connected(hooks);
                    return ConnectOutcome::Connected;
                }
                Err(e) => {
                    warn!(error = %e, "MQTT connect failed, try again in 0.5 seconds");
                    hooks.on_hardware_event();
                    self.clock.sleep(self.policy.wait_quantum);
                    let escalation = self.counter.record_failure(&self.policy);
                    let attempt = self.counter.attempt();
                    self.state = BrokerSessionState::Connecting { attempt };
                    debug!(attempt, "MQTT attempts");
                    if let Some(escalation) = escalation {
                        if escalation == Escalation::Terminal {
                            warn!(attempt, "Max retry reached, powering off peripherals.");
                        }
                        hooks.on_disconnect(escalation);
                    }
                    if !self.blocking {
                        return ConnectOutcome::RetryScheduled;
                    }
                }
            }
        }
    }

    /// Keep the session alive and deliver inbound messages.
    pub fn tick(&mut self, link: &dyn LinkStatus, hooks: &mut dyn DeviceHooks) -> ConnectOutcome {
        let outcome = self.connect(link, hooks);
        if outcome == ConnectOutcome::Connected {
            for message in self.transport.poll() {
                debug!(topic = %message.topic, bytes = message.payload.len(), "Message arrived");
                hooks.on_message(&message);
            }
        }
        outcome
    }

    /// Publish at QoS 0. Dropped when not connected.
    pub fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> PublishOutcome {
        if !self.is_connected() {
            debug!(%topic, "Not connected, publish dropped");
            return PublishOutcome::Dropped;
        }
        match self.transport.publish(topic, payload, retained) {
            Ok(()) => PublishOutcome::Delivered,
            Err(e) => {
                warn!(%topic, error = %e, "Publish failed");
                PublishOutcome::Dropped
            }
        }
    }

    pub fn publish_json(&mut self, topic: &str, value: &Value, retained: bool) -> PublishOutcome {
        self.publish(topic, value.to_string().as_bytes(), retained)
    }

    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.transport.subscribe(topic, qos)?;
        self.subscriptions.push(Subscription::new(topic, qos));
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.transport.unsubscribe(topic)?;
        self.subscriptions.retain(|s| s.topic != topic);
        Ok(())
    }

    /// Replace the will. Only allowed while disconnected.
    pub fn set_will(&mut self, will: Will) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Err(BrokerError::WillLocked);
        }
        self.will = will;
        Ok(())
    }

    /// Close the session. No further connects are made.
    pub fn shutdown(&mut self) {
        self.state = BrokerSessionState::ShuttingDown;
        self.transport.disconnect();
        self.subscriptions.clear();
        info!(client_id = %self.client_id, "Broker session closed");
    }

    pub fn is_connected(&self) -> bool {
        self.state == BrokerSessionState::Connected && self.transport.is_connected()
    }

    pub fn state(&self) -> BrokerSessionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.counter.attempt()
    }

    pub fn will(&self) -> &Will {
        &self.will
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            address: self.broker.address,
            port: self.broker.port,
            client_id: self.client_id.clone(),
            credentials: Credentials::from_parts(&self.broker.user, &self.broker.passphrase),
            will: self.will.is_enabled().then(|| self.will.clone()),
            clean_session: self.will.clean_session,
        }
    }

    fn on_connected(&mut self, hooks: &mut dyn DeviceHooks) {
        info!(client_id = %self.client_id, "MQTT connected");
        self.counter.reset();
        self.state = BrokerSessionState::Connected;
        self.subscriptions.clear();
        for subscription in hooks.on_subscribe() {
            match self.transport.subscribe(&subscription.topic, subscription.qos) {
                Ok(()) => self.subscriptions.push(subscription),
                Err(e) => warn!(topic = %subscription.topic, error = %e, "Subscribe failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ManualClock, RecordingBroker, RecordingHooks};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            address: Ipv4Addr::new(192, 168, 1, 3),
            port: 1883,
            user: String::new(),
            passphrase: String::new(),
        }
    }

    fn session(broker: &RecordingBroker, policy: RetryPolicy) -> BrokerSession<RecordingBroker> {
        BrokerSession::new(
            broker.clone(),
            broker_config(),
            "GLOW_WORM",
            policy,
            Arc::new(ManualClock::new()),
        )
    }

    #[test]
    fn test_connect_requires_link() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        assert_eq!(session.connect(&false, &mut hooks), ConnectOutcome::RetryScheduled);
        assert!(broker.connects().is_empty());
        assert_eq!(session.state(), BrokerSessionState::Disconnected);
    }

    #[test]
    fn test_connect_options() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::Connected);
        let connects = broker.connects();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].client_id, "GLOW_WORM");
        assert_eq!(connects[0].credentials, None);
        // Default will is the disabled sentinel
        assert_eq!(connects[0].will, None);
        assert!(connects[0].clean_session);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default())
            .with_will(Will::new("dev/lwt", "offline"));
        let mut hooks = RecordingHooks::new().with_subscriptions(vec![Subscription::new(
            "dev/set",
            QoS::AtLeastOnce,
        )]);

        session.connect(&true, &mut hooks);
        session.connect(&true, &mut hooks);
        session.connect(&true, &mut hooks);

        assert_eq!(hooks.subscribe_calls(), 1);
        assert_eq!(broker.connects().len(), 1);
        assert_eq!(broker.subscriptions(), vec![("dev/set".to_string(), QoS::AtLeastOnce)]);
        assert_eq!(session.will().topic, "dev/lwt");
    }

    #[test]
    fn test_blocking_connect_retries_until_up() {
        let broker = RecordingBroker::new();
        broker.fail_next(3);
        let mut session = session(&broker, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::Connected);
        assert_eq!(broker.connects().len(), 4);
        assert_eq!(session.attempt(), 0);
    }

    #[test]
    fn test_blocking_connect_services_hardware_each_failure() {
        let broker = RecordingBroker::new();
        broker.fail_next(50);
        let mut session = session(&broker, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::Connected);
        assert_eq!(broker.connects().len(), 51);
        assert_eq!(hooks.hardware_events(), 50);
    }

    #[test]
    fn test_fast_disconnect_fires_once() {
        let broker = RecordingBroker::new();
        broker.fail_next(11);
        let mut session = session(&broker, RetryPolicy::default().with_fast_disconnect(true));
        let mut hooks = RecordingHooks::new();

        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::Connected);
        assert_eq!(hooks.escalations(), vec![Escalation::FastDisconnect]);
    }

    #[test]
    fn test_non_blocking_single_attempt() {
        let broker = RecordingBroker::new();
        broker.fail_next(2);
        let mut session = session(&broker, RetryPolicy::default()).blocking(false);
        let mut hooks = RecordingHooks::new();

        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::RetryScheduled);
        assert_eq!(session.state(), BrokerSessionState::Connecting { attempt: 1 });
        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::RetryScheduled);
        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::Connected);
        assert_eq!(broker.connects().len(), 3);
    }

    #[test]
    fn test_reconnect_after_drop_resubscribes() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default());
        let mut hooks = RecordingHooks::new()
            .with_subscriptions(vec![Subscription::new("dev/set", QoS::AtMostOnce)]);

        session.connect(&true, &mut hooks);
        broker.drop_connection();
        assert!(!session.is_connected());
        assert_eq!(session.publish("dev/state", b"x", false), PublishOutcome::Dropped);

        session.tick(&true, &mut hooks);
        assert_eq!(hooks.subscribe_calls(), 2);
        assert_eq!(broker.connects().len(), 2);
    }

    #[test]
    fn test_publish_and_receive() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        assert_eq!(session.publish("dev/state", b"{}", true), PublishOutcome::Dropped);
        session.connect(&true, &mut hooks);
        assert_eq!(session.publish("dev/state", b"{}", true), PublishOutcome::Delivered);
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "dev/state");
        assert!(published[0].retain);

        broker.inject("dev/set", "ON");
        session.tick(&true, &mut hooks);
        let received = hooks.messages();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload_str(), "ON");
    }

    #[test]
    fn test_subscribe_requires_session() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default());
        assert!(matches!(
            session.subscribe("dev/set", QoS::AtLeastOnce),
            Err(BrokerError::NotConnected)
        ));

        session.connect(&true, &mut RecordingHooks::new());
        session.subscribe("dev/set", QoS::AtLeastOnce).unwrap();
        session.unsubscribe("dev/set").unwrap();
        assert!(session.subscriptions().is_empty());
    }

    #[test]
    fn test_will_locked_while_connected() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default());
        session.set_will(Will::new("dev/lwt", "offline")).unwrap();

        session.connect(&true, &mut RecordingHooks::new());
        assert_eq!(
            broker.connects()[0].will.as_ref().map(|w| w.topic.as_str()),
            Some("dev/lwt")
        );
        assert!(matches!(
            session.set_will(Will::default()),
            Err(BrokerError::WillLocked)
        ));
    }

    #[test]
    fn test_shutdown_stops_reconnects() {
        let broker = RecordingBroker::new();
        let mut session = session(&broker, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();
        session.connect(&true, &mut hooks);

        session.shutdown();
        assert_eq!(session.connect(&true, &mut hooks), ConnectOutcome::RetryScheduled);
        assert_eq!(broker.connects().len(), 1);
        assert!(!broker.is_connected());
    }
}
