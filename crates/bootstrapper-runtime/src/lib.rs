//! # bootstrapper-runtime
//!
//! Boot orchestration on top of `bootstrapper-core`.
//!
//! This crate provides:
//! - [`Bootstrapper`]: the boot sequence and the steady-state tick
//! - [`ProvisioningService`]: answers provisioning frames on the console
//! - Captive-portal submission validation
//! - Firmware-update event servicing
//! - Runtime [`Settings`]

pub mod error;
pub mod orchestrator;
pub mod portal;
pub mod provisioning;
pub mod settings;
pub mod updates;

pub use error::{BootError, PortalError};
pub use orchestrator::{BootPhase, Bootstrapper, Platform};
pub use portal::{PortalSource, PortalSubmission};
pub use provisioning::{
    device_url, DeviceIdentity, ProvisioningContext, ProvisioningOutcome, ProvisioningService,
};
pub use settings::Settings;
pub use updates::UpdateService;
