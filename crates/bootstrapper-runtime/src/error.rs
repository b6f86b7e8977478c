//! Runtime error types.

use bootstrapper_core::{ConfigError, LinkError};
use thiserror::Error;

/// Errors that stop the boot sequence.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Captive-portal submission errors. The store is untouched when one is returned.
#[derive(Debug, Error)]
pub enum PortalError {
    /// A mandatory form field was empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The submission did not form a valid record.
    #[error("Invalid submission: {0}")]
    Invalid(#[source] ConfigError),

    /// The record could not be written.
    #[error("Unable to save configuration: {0}")]
    Store(#[source] ConfigError),
}
