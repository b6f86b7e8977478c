//! Device-specific callbacks injected into the state machines.

use crate::broker::{InboundMessage, Subscription};
use crate::platform::Watchdog;
use crate::retry::Escalation;

/// Callbacks the firmware provides to the bootstrapper.
///
/// All methods have no-op defaults, so a device only overrides what it uses.
pub trait DeviceHooks: Send {
    /// A retry loop crossed an escalation threshold.
    fn on_disconnect(&mut self, escalation: Escalation) {}

    /// A fresh broker session was established. Returns the topics to subscribe.
    fn on_subscribe(&mut self) -> Vec<Subscription> {
        Vec::new()
    }

    /// Called once per wait quantum while the link is down (buttons, watchdog).
    fn on_hardware_event(&mut self) {}

    /// A message arrived on a subscribed topic.
    fn on_message(&mut self, message: &InboundMessage) {}
}

impl<H: DeviceHooks + ?Sized> DeviceHooks for Box<H> {
    fn on_disconnect(&mut self, escalation: Escalation) {
        (**self).on_disconnect(escalation)
    }

    fn on_subscribe(&mut self) -> Vec<Subscription> {
        (**self).on_subscribe()
    }

    fn on_hardware_event(&mut self) {
        (**self).on_hardware_event()
    }

    fn on_message(&mut self, message: &InboundMessage) {
        (**self).on_message(message)
    }
}

/// Device hooks paired with the watchdog.
///
/// Every wait quantum of a blocking loop feeds the watchdog before the
/// device's own hardware hook runs, so a long outage never starves it.
pub struct ServicedHooks<'a> {
    hooks: &'a mut dyn DeviceHooks,
    watchdog: &'a mut dyn Watchdog,
}

impl<'a> ServicedHooks<'a> {
    pub fn new(hooks: &'a mut dyn DeviceHooks, watchdog: &'a mut dyn Watchdog) -> Self {
        Self { hooks, watchdog }
    }
}

impl DeviceHooks for ServicedHooks<'_> {
    fn on_disconnect(&mut self, escalation: Escalation) {
        self.hooks.on_disconnect(escalation)
    }

    fn on_subscribe(&mut self) -> Vec<Subscription> {
        self.hooks.on_subscribe()
    }

    fn on_hardware_event(&mut self) {
        self.watchdog.feed();
        self.hooks.on_hardware_event()
    }

    fn on_message(&mut self, message: &InboundMessage) {
        self.hooks.on_message(message)
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl DeviceHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingHooks, RecordingSystem};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serviced_hooks_feed_watchdog_per_quantum() {
        let mut hooks = RecordingHooks::new();
        let mut system = RecordingSystem::new();
        {
            let mut serviced = ServicedHooks::new(&mut hooks, &mut system);
            for _ in 0..3 {
                serviced.on_hardware_event();
            }
            serviced.on_disconnect(Escalation::Terminal);
        }

        assert_eq!(system.feeds(), 3);
        assert_eq!(hooks.hardware_events(), 3);
        assert_eq!(hooks.escalations(), vec![Escalation::Terminal]);
    }
}
