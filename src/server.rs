/// HTTP server exposing the sync hub over WebSocket
use actix_web::{middleware, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;

use crate::config::ServerConfig;
use crate::hub::SyncHub;
use crate::websocket::SessionSocket;

/// WebSocket endpoint handler
async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    hub: web::Data<SyncHub>,
) -> Result<HttpResponse, Error> {
    let resp = ws::start(SessionSocket::new(hub), &req, stream)?;
    Ok(resp)
}

/// Health check endpoint
async fn health_check(hub: web::Data<SyncHub>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "message": "LiveFilter sync hub is running",
        "sessions": hub.len(),
    }))
}

/// Register the hub routes on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws", web::get().to(ws_index))
        .route("/health", web::get().to(health_check));
}

/// Start the HTTP server with WebSocket support
pub async fn run_server(config: ServerConfig) -> std::io::Result<()> {
    let hub = web::Data::new(SyncHub::new());

    log::info!("LiveFilter sync hub");
    log::info!("WebSocket: ws://{}/ws", config.bind_address());
    log::info!("Health check: http://{}/health", config.bind_address());

    HttpServer::new(move || {
        App::new()
            .app_data(hub.clone())
            // Enable logger
            .wrap(middleware::Logger::default())
            // CORS for development
            .wrap(
                actix_cors::Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .configure(configure)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}
