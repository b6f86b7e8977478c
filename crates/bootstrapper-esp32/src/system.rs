//! Restart and task watchdog.

use bootstrapper_core::{SystemControl, Watchdog};
use log::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        info!("Restarting");
        esp_idf_svc::hal::reset::restart();
    }
}

impl Watchdog for EspSystem {
    fn feed(&mut self) {
        // ESP_ERR_NOT_FOUND when the task is not subscribed; nothing to feed then.
        unsafe {
            esp_idf_svc::sys::esp_task_wdt_reset();
        }
    }
}
