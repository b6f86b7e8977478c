//! Device bootstrapper on a Linux host.
//!
//! Runs the same boot sequence as the firmware against host services: the
//! default route stands in for the station link, the config record is a
//! file, provisioning frames arrive on a serial port, and setup-form
//! submissions arrive over HTTP. A restart request rebuilds the bootstrapper
//! from the stored record.

mod platform;
mod portal;

use anyhow::Context;
use bootstrapper_core::{ByteStream, FileConfigStore, RetryPolicy, SystemClock};
use bootstrapper_runtime::{Bootstrapper, Platform, Settings};
use clap::Parser;
use platform::{HostLink, HostSystem, DryRunBroker, LoggingHooks, NoUpdates, SerialConsole};
use portal::SharedPortal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Parser)]
#[command(name = "bootstrapper")]
#[command(about = "Device bootstrapper host runner")]
struct Args {
    /// Path of the stored device record.
    #[arg(long, default_value = "setup.json")]
    config: PathBuf,

    /// Serial port carrying provisioning frames.
    #[arg(long)]
    serial: Option<String>,

    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Address of the setup-form endpoint.
    #[arg(long, default_value = "0.0.0.0:8080")]
    portal_addr: SocketAddr,

    #[arg(long, default_value_t = 500)]
    max_reconnect: u32,

    #[arg(long)]
    fast_disconnect: bool,

    /// One broker attempt per tick instead of retrying until connected.
    #[arg(long)]
    non_blocking_broker: bool,

    /// Ignore provisioning frames once the device is configured.
    #[arg(long)]
    no_serial_provisioning: bool,

    /// Topic carrying the current time; state is only published once it arrives.
    #[arg(long)]
    time_topic: Option<String>,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            retry: RetryPolicy::default()
                .with_max_reconnect(self.max_reconnect)
                .with_fast_disconnect(self.fast_disconnect),
            blocking_broker: !self.non_blocking_broker,
            provisioning_after_boot: !self.no_serial_provisioning,
            time_topic: self.time_topic.clone(),
            ..Settings::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,bootstrapper_runtime=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config.display(), "Bootstrapper starting...");

    let (submissions, inbox) = portal::portal_channel();
    let portal_addr = args.portal_addr;
    let portal_handle = tokio::spawn(async move {
        if let Err(e) = portal::serve(portal_addr, submissions).await {
            tracing::error!("Setup portal error: {}", e);
        }
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let boot_shutdown = shutdown.clone();
    let mut boot_handle = tokio::task::spawn_blocking(move || boot_loop(args, inbox, &boot_shutdown));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
            shutdown.store(true, Ordering::Relaxed);
            // The initial link acquisition only returns once the link is up.
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut boot_handle).await {
                Ok(Ok(Err(e))) => tracing::error!("Boot loop error: {:#}", e),
                Ok(Err(e)) => tracing::error!("Boot loop panicked: {}", e),
                Ok(Ok(Ok(()))) => {}
                Err(_) => {
                    tracing::warn!("Boot loop still acquiring the link, exiting");
                    std::process::exit(0);
                }
            }
        }
        result = &mut boot_handle => {
            match result {
                Ok(Ok(())) => tracing::warn!("Boot loop stopped"),
                Ok(Err(e)) => tracing::error!("Boot loop error: {:#}", e),
                Err(e) => tracing::error!("Boot loop panicked: {}", e),
            }
        }
        _ = portal_handle => {
            tracing::warn!("Setup portal stopped");
            shutdown.store(true, Ordering::Relaxed);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Boot, run until restart or shutdown, and boot again on restart.
fn boot_loop(args: Args, portal: SharedPortal, shutdown: &AtomicBool) -> anyhow::Result<()> {
    let clock = Arc::new(SystemClock);
    loop {
        let system = HostSystem::new();
        let console = match &args.serial {
            Some(path) => Some(Box::new(SerialConsole::open(path, args.baud)?) as Box<dyn ByteStream>),
            None => None,
        };
        let platform = Platform {
            link: Box::new(HostLink::new()),
            broker: Box::new(DryRunBroker::new()),
            store: Box::new(FileConfigStore::new(&args.config)),
            clock: clock.clone(),
            watchdog: Box::new(system.clone()),
            system: Box::new(system.clone()),
            updater: Box::new(NoUpdates),
            console,
            portal: Some(Box::new(portal.clone())),
        };

        let mut bootstrapper = Bootstrapper::new(platform, args.settings(), Box::new(LoggingHooks));
        let phase = bootstrapper.run(shutdown).context("boot sequence failed")?;
        tracing::debug!(?phase, "Boot loop ended");

        if shutdown.load(Ordering::Relaxed) || !system.take_restart() {
            return Ok(());
        }
        tracing::info!("Restarting");
    }
}
