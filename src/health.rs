use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// Liveness check.
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn detailed_health(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let active_sessions = state.active_sessions();
    let api_key_present = std::env::var(&config.upstream.api_key_env)
        .map(|key| !key.trim().is_empty())
        .unwrap_or(false);

    HttpResponse::Ok().json(json!({
        "status": if api_key_present { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "agent-voice-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "relay": {
            "active_sessions": active_sessions,
            "connections_total": metrics.connections_total,
            "upstream_errors": metrics.upstream_errors,
            "frames_to_upstream": metrics.frames_to_upstream,
            "frames_to_client": metrics.frames_to_client,
            "sidecar_updates": metrics.sidecar_updates
        },
        "upstream": {
            "url": config.upstream.url,
            "api_key_present": api_key_present,
            "transcription_model": config.upstream.transcription_model,
            "force_input_transcription": config.upstream.force_input_transcription,
            "strip_tools": config.upstream.strip_tools
        },
        "sidecar": {
            "enabled": config.sidecar.enabled,
            "model": config.sidecar.model
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "pid": process::id()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_detailed_health_reports_relay_counters() {
        let state = AppState::new(AppConfig::default());
        state.register_session("s1");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/health", web::get().to(detailed_health)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["relay"]["active_sessions"], 1);
        assert_eq!(body["relay"]["connections_total"], 1);
        assert!(body["memory"].is_object());
    }
}
