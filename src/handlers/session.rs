//! # Session Control REST API Handlers
//!
//! ## Available Endpoints:
//! - `POST /session/start` - Begin a voice session (202 Accepted)
//! - `POST /session/stop` - End the current session
//! - `GET /session/status` - Current lifecycle state, transitions and transcripts
//!
//! Starting returns once the attempt has either gone live or failed. A device
//! or network failure is not an HTTP error: the engine is back in `idle` and
//! the failure is described in the returned status.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Session start requested over HTTP");
    let status = state.engine.start().await?;

    Ok(HttpResponse::Accepted().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "status": status
    })))
}

pub async fn stop_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Session stop requested over HTTP");
    let status = state.engine.stop().await?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "status": status
    })))
}

pub async fn session_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "status": state.engine.status(),
        "page_attached": state.bridge.is_attached()
    }))
}
