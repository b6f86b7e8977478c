//! Firmware update listener servicing.

use bootstrapper_core::{FirmwareUpdater, UpdateEvent, UpdateOptions, Watchdog};
use tracing::{debug, error, info, warn};

/// Wraps the platform updater: starts it once the network is up and drains
/// its events every tick.
pub struct UpdateService {
    updater: Box<dyn FirmwareUpdater>,
    running: bool,
}

impl UpdateService {
    pub fn new(updater: Box<dyn FirmwareUpdater>) -> Self {
        Self {
            updater,
            running: false,
        }
    }

    /// Start listening. Failures are logged; the device keeps running without
    /// remote updates.
    pub fn start(&mut self, options: &UpdateOptions) -> bool {
        match self.updater.begin(options) {
            Ok(()) => {
                info!(hostname = %options.hostname, port = options.port, "Firmware update listener ready");
                self.running = true;
            }
            Err(e) => warn!(error = %e, "Firmware update listener unavailable"),
        }
        self.running
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Drain pending events. The watchdog is fed for every event, since an
    /// upload in progress keeps the main loop busy.
    pub fn service(&mut self, watchdog: &mut dyn Watchdog) -> usize {
        if !self.running {
            return 0;
        }
        let mut handled = 0;
        while let Some(event) = self.updater.poll() {
            watchdog.feed();
            handled += 1;
            match &event {
                UpdateEvent::Start => info!("Starting"),
                UpdateEvent::Progress { .. } => {
                    debug!(percent = event.percent().unwrap_or(0), "Progress")
                }
                UpdateEvent::End => info!("End"),
                UpdateEvent::Error(e) => error!(error = %e, "Firmware update failed"),
            }
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootstrapper_core::sim::{RecordingSystem, ScriptedUpdater};
    use bootstrapper_core::UpdateError;

    fn options() -> UpdateOptions {
        UpdateOptions {
            hostname: "GLOW_WORM".to_string(),
            port: 8199,
            passphrase: "ota".to_string(),
        }
    }

    #[test]
    fn test_events_ignored_until_started() {
        let updater = ScriptedUpdater::new();
        updater.push(UpdateEvent::Start);
        let mut service = UpdateService::new(Box::new(updater.clone()));
        let mut watchdog = RecordingSystem::new();

        assert_eq!(service.service(&mut watchdog), 0);
        assert_eq!(updater.pending(), 1);

        assert!(service.start(&options()));
        assert_eq!(updater.started(), vec![options()]);
        assert_eq!(service.service(&mut watchdog), 1);
    }

    #[test]
    fn test_drains_and_feeds_watchdog() {
        let updater = ScriptedUpdater::new();
        let mut service = UpdateService::new(Box::new(updater.clone()));
        let mut watchdog = RecordingSystem::new();
        service.start(&options());

        updater.push(UpdateEvent::Start);
        updater.push(UpdateEvent::Progress { done: 10, total: 100 });
        updater.push(UpdateEvent::Error(UpdateError::Receive));
        assert_eq!(service.service(&mut watchdog), 3);
        assert_eq!(watchdog.feeds(), 3);
        assert_eq!(updater.pending(), 0);
    }

    #[test]
    fn test_start_failure_is_not_fatal() {
        let updater = ScriptedUpdater::new();
        updater.set_fail_begin(true);
        let mut service = UpdateService::new(Box::new(updater));
        assert!(!service.start(&options()));
        assert!(!service.is_running());
    }
}
