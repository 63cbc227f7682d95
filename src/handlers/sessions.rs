use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Open relay connections with their transcript turn counts.
pub async fn list_relay_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.list_sessions();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_lists_open_sessions() {
        let state = AppState::new(AppConfig::default());
        state.register_session("relay-1");
        state.update_session("relay-1", |s| {
            s.upstream_connected = true;
            s.agent_turns = 3;
        });

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/relay/sessions", web::get().to(list_relay_sessions)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/relay/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["id"], "relay-1");
        assert_eq!(body["sessions"][0]["agent_turns"], 3);
        assert_eq!(body["sessions"][0]["upstream_connected"], true);
    }
}
