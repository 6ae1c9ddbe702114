use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = state.get_config();
    let status = state.engine.status();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "engine": {
            "state": status.state,
            "session_id": status.session_id,
            "error": status.error,
            "credential_configured": config.has_credential(),
            "page_attached": state.bridge.is_attached()
        },
        "metrics": {
            "sessions_started": metrics.sessions_started,
            "fatal_errors": metrics.fatal_errors,
            "send_failure_rate": ratio(metrics.send_failures, metrics.frames_captured),
            "decode_failure_rate": ratio(metrics.decode_failures, metrics.payloads_received)
        },
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let status = state.engine.status();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "engine_state": status.state,
        "counters": &metrics,
        "capture": {
            "frames_per_second": if uptime_seconds > 0 {
                metrics.frames_captured as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "send_failure_rate": ratio(metrics.send_failures, metrics.frames_captured),
            "microphone_overruns": metrics.microphone_overruns
        },
        "playback": {
            "units_in_flight": metrics.units_scheduled.saturating_sub(metrics.units_ended),
            "decode_failure_rate": ratio(metrics.decode_failures, metrics.payloads_received)
        },
        "recent_transitions": status.transitions,
        "memory": get_memory_info()
    }))
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_handles_empty_totals() {
        assert_eq!(ratio(3, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
