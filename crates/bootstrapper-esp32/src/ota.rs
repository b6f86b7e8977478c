//! Firmware updates over HTTP into the inactive OTA slot.
//!
//! `begin` starts an HTTP server on the update port. An image is uploaded
//! with `POST /update`, passphrase in `X-Update-Passphrase`, raw image as
//! the body. The handler streams the body into `EspOta` and queues
//! `UpdateEvent`s for the main loop. A completed image restarts the chip.

use bootstrapper_core::{FirmwareUpdater, UpdateError, UpdateEvent, UpdateOptions};
use esp_idf_svc::http::server::{Configuration as HttpConfiguration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::{Read, Write};
use esp_idf_svc::ota::EspOta;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

const OTA_CHUNK_SIZE: usize = 4096;
const RESTART_DELAY: Duration = Duration::from_millis(500);

type Events = Arc<Mutex<VecDeque<UpdateEvent>>>;

fn lock(events: &Mutex<VecDeque<UpdateEvent>>) -> MutexGuard<'_, VecDeque<UpdateEvent>> {
    events.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push(events: &Events, event: UpdateEvent) {
    lock(events).push_back(event);
}

#[derive(Default)]
pub struct EspOtaUpdater {
    server: Option<EspHttpServer<'static>>,
    events: Events,
}

impl EspOtaUpdater {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirmwareUpdater for EspOtaUpdater {
    fn begin(&mut self, options: &UpdateOptions) -> Result<(), UpdateError> {
        // The running image booted far enough to bring the network up
        match EspOta::new() {
            Ok(mut ota) => {
                if let Err(e) = ota.mark_running_slot_valid() {
                    warn!("Unable to mark running slot valid: {:?}", e);
                }
            }
            Err(e) => return Err(UpdateError::Unavailable(e.to_string())),
        }

        let conf = HttpConfiguration {
            http_port: options.port,
            stack_size: 16 * 1024,
            ..Default::default()
        };
        let mut server =
            EspHttpServer::new(&conf).map_err(|e| UpdateError::Unavailable(e.to_string()))?;

        let events = self.events.clone();
        let passphrase = options.passphrase.clone();
        server
            .fn_handler::<anyhow::Error, _>("/update", Method::Post, move |mut req| {
                if !passphrase.is_empty() && req.header("X-Update-Passphrase") != Some(passphrase.as_str()) {
                    push(&events, UpdateEvent::Error(UpdateError::Auth));
                    req.into_status_response(403)?.write_all(b"Auth Failed")?;
                    return Ok(());
                }
                let total = req
                    .header("Content-Length")
                    .and_then(|value| value.parse::<u32>().ok())
                    .unwrap_or(0);

                match receive_image(&mut req, total, &events) {
                    Ok(written) => {
                        info!("Update written, {} bytes", written);
                        push(&events, UpdateEvent::End);
                        req.into_ok_response()?.write_all(b"OK")?;
                        schedule_restart();
                    }
                    Err(error) => {
                        push(&events, UpdateEvent::Error(error.clone()));
                        req.into_status_response(500)?.write_all(error.to_string().as_bytes())?;
                    }
                }
                Ok(())
            })
            .map_err(|e| UpdateError::Unavailable(e.to_string()))?;

        info!("Update listener on {}:{}", options.hostname, options.port);
        self.server = Some(server);
        Ok(())
    }

    fn poll(&mut self) -> Option<UpdateEvent> {
        lock(&self.events).pop_front()
    }
}

fn receive_image(body: &mut impl Read, total: u32, events: &Events) -> Result<u32, UpdateError> {
    let mut ota = EspOta::new().map_err(|_| UpdateError::Begin)?;
    let mut update = ota.initiate_update().map_err(|_| UpdateError::Begin)?;
    push(events, UpdateEvent::Start);

    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    let mut done = 0_u32;
    loop {
        let read = match body.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(_) => {
                if let Err(e) = update.abort() {
                    warn!("Abort failed: {:?}", e);
                }
                return Err(UpdateError::Receive);
            }
        };
        if update.write(&chunk[..read]).is_err() {
            if let Err(e) = update.abort() {
                warn!("Abort failed: {:?}", e);
            }
            return Err(UpdateError::Receive);
        }
        done = done.saturating_add(read as u32);
        push(events, UpdateEvent::Progress { done, total });
    }

    if done == 0 {
        if let Err(e) = update.abort() {
            warn!("Abort failed: {:?}", e);
        }
        return Err(UpdateError::Receive);
    }
    update.complete().map_err(|_| UpdateError::End)?;
    Ok(done)
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("update-restart".into())
        .spawn(|| {
            thread::sleep(RESTART_DELAY);
            esp_idf_svc::hal::reset::restart();
        });
    if let Err(e) = spawned {
        warn!("Unable to schedule restart: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_drain_in_order() {
        let mut updater = EspOtaUpdater::new();
        push(&updater.events, UpdateEvent::Start);
        push(&updater.events, UpdateEvent::Progress { done: 4096, total: 8192 });
        push(&updater.events, UpdateEvent::End);

        assert_eq!(updater.poll(), Some(UpdateEvent::Start));
        assert_eq!(updater.poll(), Some(UpdateEvent::Progress { done: 4096, total: 8192 }));
        assert_eq!(updater.poll(), Some(UpdateEvent::End));
        assert_eq!(updater.poll(), None);
    }
}
