use crate::config::AppConfig;
use crate::state::{AppState, IngestMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "audio_path": config.server.audio_path,
            "mode": config.server.mode.as_str()
        },
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions
        },
        "turns": {
            "detected": metrics.turns_detected,
            "accepted": metrics.turns_accepted,
            "skipped": metrics.turns_skipped
        },
        "transcription": {
            "backend": state.pool.backend_name(),
            "available_slots": state.pool.available(),
            "max_concurrent": state.pool.max_concurrent()
        },
        "memory": get_memory_info(),
        "system": get_system_status(config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let uptime_seconds = state.uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "ingest": metrics,
        "derived": {
            "turn_acceptance_rate": metrics.acceptance_rate(),
            "bytes_per_second": if uptime_seconds > 0 {
                metrics.bytes_ingested as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": state.config.performance.max_concurrent_sessions,
            "max_concurrent_transcriptions": state.config.performance.max_concurrent_transcriptions
        }
    }))
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> serde_json::Value {
    let status = match std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
        Ok(status) => status,
        Err(_) => return json!({ "available": false }),
    };

    let field_bytes = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };

    json!({
        "resident_memory_bytes": field_bytes("VmRSS:"),
        "virtual_memory_bytes": field_bytes("VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> serde_json::Value {
    json!({
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(config: &AppConfig, metrics: &IngestMetrics) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "full"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions,
        "rejected_sessions": metrics.rejected_sessions
    })
}
