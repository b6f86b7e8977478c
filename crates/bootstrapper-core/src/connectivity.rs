//! Station link acquisition and loss handling.
//!
//! [`ConnectivityManager`] drives a [`LinkDriver`] from `Idle` to `Up` and
//! back after a loss. Every failed check costs one wait quantum, during
//! which the device hooks get a chance to service buttons and watchdogs.
//! Threshold crossings are reported through [`DeviceHooks::on_disconnect`];
//! the manager never takes the interface down on its own.

use crate::hooks::DeviceHooks;
use crate::link::{LinkDriver, LinkError, LinkProfile, LinkStatus};
use crate::platform::Clock;
use crate::retry::{Escalation, RetryCounter, RetryPolicy};
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Link state as seen by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Not started, or reconfigured and waiting to start.
    Idle,
    /// Joining; `attempt` failed checks so far.
    Acquiring { attempt: u32 },
    Up {
        since: DateTime<Utc>,
        address: Ipv4Addr,
    },
    /// Was up, link dropped, re-join requested.
    Lost,
}

/// Result of a single acquisition quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    Up(Ipv4Addr),
    Retrying { attempt: u32 },
    Escalated { attempt: u32, escalation: Escalation },
}

/// Map a signal strength in dBm to a 0..=100 quality percentage.
pub fn quality_from_rssi(dbm: i32) -> u8 {
    if dbm <= -100 {
        0
    } else if dbm >= -50 {
        100
    } else {
        (2 * (dbm + 100)) as u8
    }
}

/// Connectivity state machine.
pub struct ConnectivityManager<L> {
    driver: L,
    profile: LinkProfile,
    policy: RetryPolicy,
    counter: RetryCounter,
    state: ConnectivityState,
    clock: Arc<dyn Clock>,
}

impl<L: LinkDriver> ConnectivityManager<L> {
    pub fn new(driver: L, profile: LinkProfile, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            driver,
            profile,
            policy,
            counter: RetryCounter::new(),
            state: ConnectivityState::Idle,
            clock,
        }
    }

    /// Configure the interface and begin joining.
    pub fn start(&mut self) -> Result<(), LinkError> {
        info!(
            hostname = %self.profile.hostname(),
            wired = self.profile.is_wired(),
            "Connecting to network"
        );
        self.driver.begin(&self.profile)?;
        self.counter.reset();
        self.state = ConnectivityState::Acquiring { attempt: 0 };
        Ok(())
    }

    /// Run one acquisition quantum.
    ///
    /// Returns immediately when the link is up. Otherwise services the
    /// hardware hook, waits one quantum and counts the failure.
    pub fn step(&mut self, hooks: &mut dyn DeviceHooks) -> LinkStep {
        if self.driver.is_up() {
            return LinkStep::Up(self.commit_up());
        }

        hooks.on_hardware_event();
        self.clock.sleep(self.policy.wait_quantum);
        let escalation = self.counter.record_failure(&self.policy);
        let attempt = self.counter.attempt();
        self.state = ConnectivityState::Acquiring { attempt };
        debug!(attempt, "Wifi attempts");

        match escalation {
            Some(escalation) => {
                if escalation == Escalation::Terminal {
                    warn!(attempt, "Max retry reached, powering off peripherals.");
                } else {
                    warn!(attempt, "Link still down, fast disconnect");
                }
                hooks.on_disconnect(escalation);
                LinkStep::Escalated { attempt, escalation }
            }
            None => LinkStep::Retrying { attempt },
        }
    }

    /// Block until the link is up.
    pub fn acquire(&mut self, hooks: &mut dyn DeviceHooks) -> Result<Ipv4Addr, LinkError> {
        if self.state == ConnectivityState::Idle {
            self.start()?;
        }
        loop {
            if let LinkStep::Up(address) = self.step(hooks) {
                return Ok(address);
            }
        }
    }

    /// Try for at most `max_quanta` quanta. `None` when the link stayed down.
    pub fn join(&mut self, max_quanta: u32, hooks: &mut dyn DeviceHooks) -> Option<Ipv4Addr> {
        if self.state == ConnectivityState::Idle {
            if let Err(e) = self.start() {
                warn!(error = %e, "Unable to start link");
                return None;
            }
        }
        for _ in 0..=max_quanta {
            if let LinkStep::Up(address) = self.step(hooks) {
                return Some(address);
            }
        }
        None
    }

    /// Bring the link back if it dropped. A no-op while up.
    pub fn reconnect(&mut self, hooks: &mut dyn DeviceHooks) -> Result<Ipv4Addr, LinkError> {
        if self.driver.is_up() {
            return Ok(match &self.state {
                ConnectivityState::Up { address, .. } => *address,
                _ => self.commit_up(),
            });
        }

        if matches!(self.state, ConnectivityState::Up { .. }) {
            warn!("WiFi connection lost, reconnecting");
            self.state = ConnectivityState::Lost;
            self.counter.reset();
            if let Err(e) = self.driver.rejoin() {
                warn!(error = %e, "Rejoin request failed");
            }
        }
        self.acquire(hooks)
    }

    /// Replace the profile. The next `acquire` or `join` restarts the interface.
    pub fn reconfigure(&mut self, profile: LinkProfile) {
        if self.state != ConnectivityState::Idle {
            self.driver.disconnect();
        }
        self.profile = profile;
        self.counter.reset();
        self.state = ConnectivityState::Idle;
    }

    pub fn is_up(&self) -> bool {
        self.driver.is_up()
    }

    pub fn state(&self) -> &ConnectivityState {
        &self.state
    }

    pub fn attempt(&self) -> u32 {
        self.counter.attempt()
    }

    /// The committed address while up.
    pub fn address(&self) -> Option<Ipv4Addr> {
        match &self.state {
            ConnectivityState::Up { address, .. } if self.driver.is_up() => Some(*address),
            _ => None,
        }
    }

    /// Signal quality percentage, `None` while down or on wired links.
    pub fn signal_quality(&self) -> Option<u8> {
        if !self.driver.is_up() {
            return None;
        }
        self.driver.rssi().map(quality_from_rssi)
    }

    pub fn mac_address(&self) -> Option<String> {
        self.driver.mac_address()
    }

    /// Ping the gateway to keep the association alive.
    ///
    /// Skipped while the link is down. A failed ping is only reported; the
    /// next reconnect check decides whether the link is gone.
    pub fn ping_gateway(&mut self) -> Option<bool> {
        if !matches!(self.state, ConnectivityState::Up { .. }) || !self.driver.is_up() {
            return None;
        }
        let reply = self.driver.ping_gateway();
        match reply {
            Some(true) => debug!("Gateway ping ok"),
            Some(false) => warn!("PING KO"),
            None => {}
        }
        reply
    }

    pub fn profile(&self) -> &LinkProfile {
        &self.profile
    }

    pub fn driver(&self) -> &L {
        &self.driver
    }

    fn commit_up(&mut self) -> Ipv4Addr {
        let address = self
            .driver
            .local_address()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let since = match &self.state {
            ConnectivityState::Up { since, address: held } if *held == address => *since,
            _ => {
                info!(%address, hostname = %self.profile.hostname(), "WIFI CONNECTED");
                self.clock.now()
            }
        };
        self.counter.reset();
        self.state = ConnectivityState::Up { since, address };
        address
    }
}

impl<L: LinkDriver> LinkStatus for ConnectivityManager<L> {
    fn is_up(&self) -> bool {
        self.driver.is_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::sim::{ManualClock, RecordingHooks, SimulatedLink};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn manager(link: &SimulatedLink, policy: RetryPolicy) -> (ConnectivityManager<SimulatedLink>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let profile = LinkProfile::from_config(&DeviceConfig::for_wifi("dev", "home", "pw"));
        let mgr = ConnectivityManager::new(link.clone(), profile, policy, clock.clone());
        (mgr, clock)
    }

    #[test]
    fn test_quality_mapping() {
        assert_eq!(quality_from_rssi(-120), 0);
        assert_eq!(quality_from_rssi(-100), 0);
        assert_eq!(quality_from_rssi(-75), 50);
        assert_eq!(quality_from_rssi(-50), 100);
        assert_eq!(quality_from_rssi(-20), 100);
    }

    #[test]
    fn test_step_counts_until_up() {
        let link = SimulatedLink::new(Ipv4Addr::new(192, 168, 1, 40));
        link.set_join_delay(Some(3));
        let (mut mgr, clock) = manager(&link, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        mgr.start().unwrap();
        assert_eq!(mgr.step(&mut hooks), LinkStep::Retrying { attempt: 1 });
        assert_eq!(mgr.step(&mut hooks), LinkStep::Retrying { attempt: 2 });
        assert_eq!(mgr.step(&mut hooks), LinkStep::Retrying { attempt: 3 });
        assert_eq!(mgr.state(), &ConnectivityState::Acquiring { attempt: 3 });
        assert_eq!(
            mgr.step(&mut hooks),
            LinkStep::Up(Ipv4Addr::new(192, 168, 1, 40))
        );

        // Counter resets to exactly zero on success
        assert_eq!(mgr.attempt(), 0);
        assert_eq!(mgr.address(), Some(Ipv4Addr::new(192, 168, 1, 40)));
        assert_eq!(hooks.hardware_events(), 3);
        assert_eq!(clock.slept(), Duration::from_millis(1500));
    }

    #[test]
    fn test_acquire_escalates_but_keeps_going() {
        let link = SimulatedLink::new(Ipv4Addr::new(10, 0, 0, 7));
        link.set_join_delay(Some(25));
        let (mut mgr, _clock) = manager(&link, RetryPolicy::default().with_fast_disconnect(true));
        let mut hooks = RecordingHooks::new();

        let address = mgr.acquire(&mut hooks).unwrap();
        assert_eq!(address, Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(hooks.escalations(), vec![Escalation::FastDisconnect]);
        // Escalation never touches the interface
        assert_eq!(link.disconnects(), 0);
    }

    #[test]
    fn test_join_is_bounded() {
        let link = SimulatedLink::new(Ipv4Addr::new(10, 0, 0, 7));
        let (mut mgr, _clock) = manager(&link, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        assert_eq!(mgr.join(5, &mut hooks), None);
        assert_eq!(link.begins().len(), 1);
        assert_eq!(mgr.attempt(), 6);
    }

    #[test]
    fn test_reconnect_is_noop_when_up() {
        let link = SimulatedLink::new(Ipv4Addr::new(10, 0, 0, 7));
        link.bring_up();
        let (mut mgr, clock) = manager(&link, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        mgr.acquire(&mut hooks).unwrap();
        let since = match mgr.state() {
            ConnectivityState::Up { since, .. } => *since,
            other => panic!("expected Up, got {other:?}"),
        };
        clock.advance(Duration::from_secs(30));

        mgr.reconnect(&mut hooks).unwrap();
        assert_eq!(link.rejoins(), 0);
        // Still the first Up transition
        assert!(matches!(mgr.state(), ConnectivityState::Up { since: s, .. } if *s == since));
    }

    #[test]
    fn test_reconnect_after_loss_rejoins() {
        let link = SimulatedLink::new(Ipv4Addr::new(10, 0, 0, 7));
        link.bring_up();
        let (mut mgr, _clock) = manager(&link, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();
        mgr.acquire(&mut hooks).unwrap();

        link.drop_link();
        link.set_join_delay(Some(2));
        assert_eq!(mgr.address(), None);
        assert_eq!(mgr.signal_quality(), None);

        mgr.reconnect(&mut hooks).unwrap();
        assert_eq!(link.rejoins(), 1);
        assert_eq!(mgr.attempt(), 0);
        assert!(mgr.is_up());
    }

    #[test]
    fn test_reconfigure_restarts_interface() {
        let link = SimulatedLink::new(Ipv4Addr::new(10, 0, 0, 7));
        link.bring_up();
        let (mut mgr, _clock) = manager(&link, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();
        mgr.acquire(&mut hooks).unwrap();

        let profile = LinkProfile::from_config(&DeviceConfig::for_wifi("dev2", "other", ""));
        mgr.reconfigure(profile.clone());
        assert_eq!(mgr.state(), &ConnectivityState::Idle);
        assert_eq!(link.disconnects(), 1);

        link.set_join_delay(Some(0));
        assert!(mgr.join(3, &mut hooks).is_some());
        let begins = link.begins();
        assert_eq!(begins.len(), 2);
        assert_eq!(begins[1], profile);
    }

    #[test]
    fn test_gateway_ping_only_while_up() {
        let link = SimulatedLink::new(Ipv4Addr::new(10, 0, 0, 7));
        link.set_gateway_reply(Some(false));
        let (mut mgr, _clock) = manager(&link, RetryPolicy::default());
        let mut hooks = RecordingHooks::new();

        assert_eq!(mgr.ping_gateway(), None);
        assert_eq!(link.pings(), 0);

        link.bring_up();
        mgr.acquire(&mut hooks).unwrap();
        assert_eq!(mgr.ping_gateway(), Some(false));
        link.set_gateway_reply(Some(true));
        assert_eq!(mgr.ping_gateway(), Some(true));
        assert_eq!(link.pings(), 2);
        // A failed ping leaves the link state alone
        assert!(matches!(mgr.state(), ConnectivityState::Up { .. }));
    }
}
