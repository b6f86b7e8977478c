//! Simulated platform.
//!
//! In-process doubles for every platform trait. Each double is a cheap
//! handle over shared state, so a test can move one clone into the
//! bootstrapper and keep another to script behaviour and inspect calls.
//! The host runner also uses them when no real hardware is attached.

use crate::broker::{BrokerError, BrokerTransport, ConnectOptions, InboundMessage, QoS, Subscription};
use crate::hooks::DeviceHooks;
use crate::link::{LinkDriver, LinkError, LinkProfile};
use crate::platform::{
    ByteStream, Clock, FirmwareUpdater, SystemControl, UpdateError, UpdateEvent, UpdateOptions,
    Watchdog,
};
use crate::retry::Escalation;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Link
// ============================================================================

#[derive(Debug)]
struct LinkSim {
    up: bool,
    address: Ipv4Addr,
    rssi: Option<i32>,
    mac: String,
    join_delay: Option<u32>,
    pending_join: Option<u32>,
    fail_begin: bool,
    begins: Vec<LinkProfile>,
    rejoins: u32,
    disconnects: u32,
    gateway_reply: Option<bool>,
    pings: u32,
}

/// Link whose status is scripted by the test.
///
/// By default the link never comes up on its own. With a join delay of `n`,
/// the link reports up on the `n + 1`-th status check after `begin` or
/// `rejoin`.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    inner: Arc<Mutex<LinkSim>>,
}

impl SimulatedLink {
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkSim {
                up: false,
                address,
                rssi: Some(-60),
                mac: "02:00:00:00:00:01".to_string(),
                join_delay: None,
                pending_join: None,
                fail_begin: false,
                begins: Vec::new(),
                rejoins: 0,
                disconnects: 0,
                gateway_reply: None,
                pings: 0,
            })),
        }
    }

    pub fn set_join_delay(&self, checks: Option<u32>) {
        lock(&self.inner).join_delay = checks;
    }

    pub fn set_rssi(&self, rssi: Option<i32>) {
        lock(&self.inner).rssi = rssi;
    }

    pub fn set_fail_begin(&self, fail: bool) {
        lock(&self.inner).fail_begin = fail;
    }

    /// Answer to gateway pings; `None` means the platform cannot ping.
    pub fn set_gateway_reply(&self, reply: Option<bool>) {
        lock(&self.inner).gateway_reply = reply;
    }

    pub fn pings(&self) -> u32 {
        lock(&self.inner).pings
    }

    pub fn bring_up(&self) {
        let mut sim = lock(&self.inner);
        sim.up = true;
        sim.pending_join = None;
    }

    pub fn drop_link(&self) {
        let mut sim = lock(&self.inner);
        sim.up = false;
        sim.pending_join = None;
    }

    pub fn begins(&self) -> Vec<LinkProfile> {
        lock(&self.inner).begins.clone()
    }

    pub fn rejoins(&self) -> u32 {
        lock(&self.inner).rejoins
    }

    pub fn disconnects(&self) -> u32 {
        lock(&self.inner).disconnects
    }
}

impl LinkDriver for SimulatedLink {
    fn begin(&mut self, profile: &LinkProfile) -> Result<(), LinkError> {
        let mut sim = lock(&self.inner);
        if sim.fail_begin {
            return Err(LinkError::Start("simulated failure".to_string()));
        }
        sim.begins.push(profile.clone());
        if !sim.up {
            sim.pending_join = sim.join_delay;
        }
        Ok(())
    }

    fn is_up(&self) -> bool {
        let mut sim = lock(&self.inner);
        match sim.pending_join {
            Some(0) => {
                sim.up = true;
                sim.pending_join = None;
            }
            Some(n) => sim.pending_join = Some(n - 1),
            None => {}
        }
        sim.up
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        let sim = lock(&self.inner);
        sim.up.then_some(sim.address)
    }

    fn rssi(&self) -> Option<i32> {
        lock(&self.inner).rssi
    }

    fn rejoin(&mut self) -> Result<(), LinkError> {
        let mut sim = lock(&self.inner);
        sim.rejoins += 1;
        sim.pending_join = sim.join_delay;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut sim = lock(&self.inner);
        sim.up = false;
        sim.pending_join = None;
        sim.disconnects += 1;
    }

    fn mac_address(&self) -> Option<String> {
        Some(lock(&self.inner).mac.clone())
    }

    fn ping_gateway(&mut self) -> Option<bool> {
        let mut sim = lock(&self.inner);
        sim.pings += 1;
        sim.gateway_reply.map(|reply| reply && sim.up)
    }
}

// ============================================================================
// Broker
// ============================================================================

/// A publish captured by [`RecordingBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct BrokerSim {
    connected: bool,
    fail_next: u32,
    connects: Vec<ConnectOptions>,
    subscriptions: Vec<(String, QoS)>,
    published: Vec<Published>,
    inbox: VecDeque<InboundMessage>,
}

/// Broker that records everything and fails on demand.
#[derive(Debug, Clone, Default)]
pub struct RecordingBroker {
    inner: Arc<Mutex<BrokerSim>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connects.
    pub fn fail_next(&self, n: u32) {
        lock(&self.inner).fail_next = n;
    }

    /// Simulate the broker closing the session.
    pub fn drop_connection(&self) {
        lock(&self.inner).connected = false;
    }

    /// Queue an inbound message for the next poll.
    pub fn inject(&self, topic: &str, payload: &str) {
        lock(&self.inner)
            .inbox
            .push_back(InboundMessage::new(topic, payload.as_bytes()));
    }

    pub fn connects(&self) -> Vec<ConnectOptions> {
        lock(&self.inner).connects.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.inner).subscriptions.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.inner).published.clone()
    }
}

impl BrokerTransport for RecordingBroker {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        let mut sim = lock(&self.inner);
        sim.connects.push(options.clone());
        if sim.fail_next > 0 {
            sim.fail_next -= 1;
            return Err(BrokerError::ConnectFailed("rc=-2".to_string()));
        }
        sim.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError> {
        let mut sim = lock(&self.inner);
        if !sim.connected {
            return Err(BrokerError::NotConnected);
        }
        sim.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        lock(&self.inner).subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        lock(&self.inner).subscriptions.retain(|(t, _)| t != topic);
        Ok(())
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        lock(&self.inner).inbox.drain(..).collect()
    }

    fn disconnect(&mut self) {
        lock(&self.inner).connected = false;
    }
}

// ============================================================================
// Clock
// ============================================================================

#[derive(Debug)]
struct ClockSim {
    now: DateTime<Utc>,
    slept: Duration,
}

/// Clock that only moves when slept on or advanced.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ClockSim>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::starting_at(start)
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ClockSim {
                now,
                slept: Duration::ZERO,
            }),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut sim = lock(&self.inner);
        sim.now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Total time spent in `sleep`.
    pub fn slept(&self) -> Duration {
        lock(&self.inner).slept
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        lock(&self.inner).now
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        lock(&self.inner).slept += duration;
    }
}

// ============================================================================
// Hooks
// ============================================================================

#[derive(Debug, Default)]
struct HooksSim {
    subscriptions: Vec<Subscription>,
    escalations: Vec<Escalation>,
    hardware_events: u32,
    subscribe_calls: u32,
    messages: Vec<InboundMessage>,
}

/// Hooks that record every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    inner: Arc<Mutex<HooksSim>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics returned from `on_subscribe`.
    pub fn with_subscriptions(self, subscriptions: Vec<Subscription>) -> Self {
        lock(&self.inner).subscriptions = subscriptions;
        self
    }

    pub fn escalations(&self) -> Vec<Escalation> {
        lock(&self.inner).escalations.clone()
    }

    pub fn hardware_events(&self) -> u32 {
        lock(&self.inner).hardware_events
    }

    pub fn subscribe_calls(&self) -> u32 {
        lock(&self.inner).subscribe_calls
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        lock(&self.inner).messages.clone()
    }
}

impl DeviceHooks for RecordingHooks {
    fn on_disconnect(&mut self, escalation: Escalation) {
        lock(&self.inner).escalations.push(escalation);
    }

    fn on_subscribe(&mut self) -> Vec<Subscription> {
        let mut sim = lock(&self.inner);
        sim.subscribe_calls += 1;
        sim.subscriptions.clone()
    }

    fn on_hardware_event(&mut self) {
        lock(&self.inner).hardware_events += 1;
    }

    fn on_message(&mut self, message: &InboundMessage) {
        lock(&self.inner).messages.push(message.clone());
    }
}

// ============================================================================
// System, watchdog, updater
// ============================================================================

#[derive(Debug, Default)]
struct SystemSim {
    restarts: u32,
    feeds: u64,
}

/// Records restart requests and watchdog feeds.
#[derive(Debug, Clone, Default)]
pub struct RecordingSystem {
    inner: Arc<Mutex<SystemSim>>,
}

impl RecordingSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restarts(&self) -> u32 {
        lock(&self.inner).restarts
    }

    pub fn feeds(&self) -> u64 {
        lock(&self.inner).feeds
    }
}

impl SystemControl for RecordingSystem {
    fn restart(&mut self) {
        lock(&self.inner).restarts += 1;
    }
}

impl Watchdog for RecordingSystem {
    fn feed(&mut self) {
        lock(&self.inner).feeds += 1;
    }
}

#[derive(Debug, Default)]
struct UpdaterSim {
    started: Vec<UpdateOptions>,
    events: VecDeque<UpdateEvent>,
    fail_begin: bool,
}

/// Update listener replaying queued events.
#[derive(Debug, Clone, Default)]
pub struct ScriptedUpdater {
    inner: Arc<Mutex<UpdaterSim>>,
}

impl ScriptedUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: UpdateEvent) {
        lock(&self.inner).events.push_back(event);
    }

    pub fn set_fail_begin(&self, fail: bool) {
        lock(&self.inner).fail_begin = fail;
    }

    pub fn started(&self) -> Vec<UpdateOptions> {
        lock(&self.inner).started.clone()
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner).events.len()
    }
}

impl FirmwareUpdater for ScriptedUpdater {
    fn begin(&mut self, options: &UpdateOptions) -> Result<(), UpdateError> {
        let mut sim = lock(&self.inner);
        if sim.fail_begin {
            return Err(UpdateError::Unavailable("simulated".to_string()));
        }
        sim.started.push(options.clone());
        Ok(())
    }

    fn poll(&mut self) -> Option<UpdateEvent> {
        lock(&self.inner).events.pop_front()
    }
}

// ============================================================================
// Byte stream
// ============================================================================

#[derive(Debug, Default)]
struct StreamSim {
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
}

/// Byte stream fed by the test; captures every written frame.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStream {
    inner: Arc<Mutex<StreamSim>>,
}

impl ScriptedStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.inner).inbound.extend(bytes.iter().copied());
    }

    /// Frames written so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).written.clone()
    }

    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut lock(&self.inner).written)
    }

    pub fn unread(&self) -> usize {
        lock(&self.inner).inbound.len()
    }
}

impl ByteStream for ScriptedStream {
    fn try_read(&mut self) -> Option<u8> {
        lock(&self.inner).inbound.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) {
        lock(&self.inner).written.push(bytes.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_join_delay() {
        let mut link = SimulatedLink::new(Ipv4Addr::new(10, 0, 0, 2));
        link.set_join_delay(Some(1));
        assert!(!link.is_up());

        let profile = LinkProfile::from_config(&crate::DeviceConfig::for_wifi("d", "s", ""));
        link.begin(&profile).unwrap();
        assert!(!link.is_up());
        assert!(link.is_up());
        assert_eq!(link.local_address(), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_clock_sleep_advances_time() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(500));
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(500));
        assert_eq!(clock.slept(), Duration::from_millis(500));
    }
}
