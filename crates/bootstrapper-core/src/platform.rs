//! Platform services used by the bootstrapper.
//!
//! Everything that touches hardware or wall-clock time goes through one of
//! these traits, so the state machines can run against simulated doubles:
//! - [`Clock`]: current time and blocking waits
//! - [`Watchdog`]: task watchdog feeding
//! - [`SystemControl`]: warm restart
//! - [`FirmwareUpdater`]: over-the-air update listener
//! - [`ByteStream`]: the serial provisioning channel

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Block the current thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Task watchdog.
pub trait Watchdog: Send {
    fn feed(&mut self);
}

/// System-level control.
pub trait SystemControl: Send {
    /// Request a warm restart. On hardware this does not return; on a host the
    /// runner observes the request and rebuilds the bootstrapper.
    fn restart(&mut self);
}

/// Parameters for the firmware update listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    pub hostname: String,
    pub port: u16,
    pub passphrase: String,
}

/// Firmware update failures, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("Auth Failed")]
    Auth,
    #[error("Begin Failed")]
    Begin,
    #[error("Connect Failed")]
    Connect,
    #[error("Receive Failed")]
    Receive,
    #[error("End Failed")]
    End,
    #[error("Listener unavailable: {0}")]
    Unavailable(String),
}

/// Progress notifications from the update listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Start,
    Progress { done: u32, total: u32 },
    End,
    Error(UpdateError),
}

impl UpdateEvent {
    /// Completion percentage for progress events.
    pub fn percent(&self) -> Option<u32> {
        match self {
            UpdateEvent::Progress { done, total } if *total > 0 => {
                Some((u64::from(*done) * 100 / u64::from(*total)) as u32)
            }
            _ => None,
        }
    }
}

/// Over-the-air firmware update listener.
pub trait FirmwareUpdater: Send {
    /// Start listening. Called once the network is up.
    fn begin(&mut self, options: &UpdateOptions) -> Result<(), UpdateError>;

    /// Next pending event, if any. Never blocks.
    fn poll(&mut self) -> Option<UpdateEvent>;
}

/// Non-blocking byte channel carrying provisioning frames.
pub trait ByteStream: Send {
    /// Next available byte, `None` when nothing is buffered.
    fn try_read(&mut self) -> Option<u8>;

    /// Write a whole frame.
    fn write(&mut self, bytes: &[u8]);
}
