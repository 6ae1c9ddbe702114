use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration. The credential itself is never echoed.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "session": {
            "credential_configured": config.has_credential(),
            "endpoint": config.session.endpoint,
            "model": config.session.model,
            "voice_name": config.session.voice_name,
            "system_instruction": config.session.system_instruction,
            "enable_search": config.session.enable_search,
            "outbound_queue_frames": config.session.outbound_queue_frames,
            "open_timeout_ms": config.session.open_timeout_ms
        },
        "audio": {
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate,
            "output_channels": config.audio.output_channels,
            "frame_size": config.audio.frame_size,
            "fft_size": config.audio.fft_size
        },
        "visualizer": {
            "width": config.visualizer.width,
            "height": config.visualizer.height,
            "refresh_hz": config.visualizer.refresh_hz
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial update; takes effect for the next session.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_view_hides_credential() {
        let mut config = AppConfig::default();
        config.session.api_key = "secret-key".to_string();

        let view = config_view(&config);
        assert_eq!(view["session"]["credential_configured"], true);
        assert!(!view.to_string().contains("secret-key"));
    }
}
