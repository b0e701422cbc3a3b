//! HTTP server assembly: routes, middleware, and the listener.
//!
//! Health and metrics live under fixed routes; every other path goes to the
//! WebSocket upgrade handler, which accepts `server.audio_path` and rejects
//! anything else with a policy close.

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use std::net::TcpListener;
use tracing_actix_web::TracingLogger;

use crate::health;
use crate::state::AppState;
use crate::websocket;

/// Register every route on an `App` or a test service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics)),
    )
    .route("/health", web::get().to(health::health_check))
    .default_service(web::route().to(websocket::audio_websocket));
}

/// Build the server on an already bound listener.
///
/// Binding is left to the caller so tests can listen on port 0.
pub fn build_server(state: AppState, listener: TcpListener, workers: Option<usize>) -> std::io::Result<Server> {
    let data = web::Data::new(state);

    let mut server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(configure)
    })
    .listen(listener)?;

    if let Some(workers) = workers {
        server = server.workers(workers);
    }

    Ok(server.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::engine::NullTranscriber;
    use crate::transcription::responder::RuleResponder;
    use actix_web::{http::StatusCode, test};
    use std::sync::Arc;

    fn test_state() -> AppState {
        AppState::with_backends(AppConfig::default(), Arc::new(NullTranscriber), Arc::new(RuleResponder))
    }

    #[actix_web::test]
    async fn test_routes() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .configure(configure),
        )
        .await;

        for uri in ["/health", "/api/v1/health", "/api/v1/metrics"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
        }

        // plain HTTP on an unknown path is not an upgrade
        let resp = test::call_service(&app, test::TestRequest::get().uri("/nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // plain HTTP on the audio path fails the handshake
        let resp = test::call_service(&app, test::TestRequest::get().uri("/ws/audio").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
