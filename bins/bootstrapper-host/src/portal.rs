//! Captive-portal submission endpoint.
//!
//! `GET /setting?deviceName=..&ssid=..` is validated here for an immediate
//! answer, then forwarded to the bootstrapper, which applies it on its next
//! tick.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use bootstrapper_runtime::{PortalSource, PortalSubmission};
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Receiving end shared by successive boots of the runner.
#[derive(Clone)]
pub struct SharedPortal {
    inbox: Arc<Mutex<Receiver<PortalSubmission>>>,
}

impl PortalSource for SharedPortal {
    fn next_submission(&mut self) -> Option<PortalSubmission> {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }
}

/// Create the submission channel.
pub fn portal_channel() -> (Sender<PortalSubmission>, SharedPortal) {
    let (tx, rx) = channel();
    (
        tx,
        SharedPortal {
            inbox: Arc::new(Mutex::new(rx)),
        },
    )
}

pub fn router(submissions: Sender<PortalSubmission>) -> Router {
    Router::new()
        .route("/setting", get(setting_handler))
        .with_state(submissions)
}

/// Serve the portal endpoint until the listener fails.
pub async fn serve(addr: SocketAddr, submissions: Sender<PortalSubmission>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Setup portal listening on {}", addr);
    axum::serve(listener, router(submissions)).await?;
    Ok(())
}

async fn setting_handler(
    State(submissions): State<Sender<PortalSubmission>>,
    Query(submission): Query<PortalSubmission>,
) -> (StatusCode, String) {
    if let Err(e) = submission.validate() {
        warn!(error = %e, "Rejected setup submission");
        return (StatusCode::BAD_REQUEST, format!("Error: {e}"));
    }
    match submissions.send(submission) {
        Ok(()) => (
            StatusCode::OK,
            "Success: rebooting the microcontroller using your credentials.".to_string(),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Error: device is not accepting settings".to_string(),
        ),
    }
}
